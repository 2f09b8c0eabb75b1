pub(crate) mod comment;
pub(crate) mod error;
pub(crate) mod filter;
pub(crate) mod like;
pub(crate) mod post;
