mod maintenance;
mod worker;

pub(crate) use maintenance::{
    reclaim_queue_leases, recover_stale_in_progress, requeue_orphaned_pending,
};
pub(crate) use worker::process_delivery;
