pub(crate) mod memory_store;
pub(crate) mod post_repository;
pub(crate) mod remote_store;
pub(crate) mod repositories;
