pub mod error;
pub(crate) mod text;
