/// 进程存活探测
///
/// 无法确定时必须返回 `true`：误判为死亡会让仍在执行的任务被清理。
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, process_id: u32) -> bool;
}

impl<T: ProcessProbe + ?Sized> ProcessProbe for std::sync::Arc<T> {
    fn is_alive(&self, process_id: u32) -> bool {
        (**self).is_alive(process_id)
    }
}
