pub mod images;
pub mod inspect;
pub mod load;
