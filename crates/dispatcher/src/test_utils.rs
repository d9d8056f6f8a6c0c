use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use taskqueue_domain::ports::ProcessProbe;
use taskqueue_infrastructure::DatabaseManager;

use crate::TaskQueue;

/// 可由测试控制的进程探测，未标记为死亡的进程都视为存活
#[derive(Debug, Clone, Default)]
pub struct StaticProcessProbe {
    dead: Arc<Mutex<HashSet<u32>>>,
}

impl StaticProcessProbe {
    pub fn all_alive() -> Self {
        Self::default()
    }

    pub fn mark_dead(&self, process_id: u32) {
        self.dead.lock().unwrap().insert(process_id);
    }
}

impl ProcessProbe for StaticProcessProbe {
    fn is_alive(&self, process_id: u32) -> bool {
        !self.dead.lock().unwrap().contains(&process_id)
    }
}

/// 基于单连接内存数据库的队列
pub async fn in_memory_queue() -> TaskQueue {
    let manager = DatabaseManager::in_memory().await.unwrap();
    TaskQueue::new(std::sync::Arc::new(manager.task_repository()))
}
