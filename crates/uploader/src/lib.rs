mod update_list;
mod worker;

pub use update_list::{PackedMipLoad, UpdateList, UpdateListPool, UpdateListState};
pub use worker::{UploadWorker, WorkerCommand, WorkerNotice};
