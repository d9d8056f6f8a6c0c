use taskqueue_domain::ports::ProcessProbe;
use tracing::warn;

/// 基于操作系统的进程存活探测
///
/// Unix 下发送空信号：成功或 `EPERM` 视为存活，只有 `ESRCH` 视为已退出。
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessProbe;

impl OsProcessProbe {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
impl ProcessProbe for OsProcessProbe {
    fn is_alive(&self, process_id: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        // 0 和超出 pid_t 的值会被 kill 解释为进程组，无法用于探测
        let raw_pid = match i32::try_from(process_id) {
            Ok(pid) if pid > 0 => pid,
            _ => {
                warn!("无法探测进程 {}，按存活处理", process_id);
                return true;
            }
        };

        match kill(Pid::from_raw(raw_pid), None) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(Errno::EPERM) => true,
            Err(e) => {
                warn!("探测进程 {} 失败: {}，按存活处理", process_id, e);
                true
            }
        }
    }
}

#[cfg(not(unix))]
impl ProcessProbe for OsProcessProbe {
    fn is_alive(&self, process_id: u32) -> bool {
        warn!("当前平台不支持进程探测，进程 {} 按存活处理", process_id);
        true
    }
}
