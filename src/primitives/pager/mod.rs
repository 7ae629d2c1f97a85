#![forbid(unsafe_code)]

mod source;

pub use source::{PageImage, PageSource};
