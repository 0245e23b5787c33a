pub mod image;
pub mod page;
