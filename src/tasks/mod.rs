pub(crate) mod correction;
pub(crate) mod scheduler;
