pub(crate) mod remote;
