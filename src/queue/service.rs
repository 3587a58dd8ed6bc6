use crate::engine::{AnalyticsEngine, EngineOperation, EngineOutput};
use crate::queue::model::{ActionDescriptor, QueueError, QueuePriority, QueueStats};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error, info, warn};
use std::any::Any;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

type Reply = oneshot::Sender<Result<EngineOutput, QueueError>>;

/// 优先级高的在前，同优先级按入队序号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SlotKey {
    priority: Reverse<QueuePriority>,
    seq: u64,
}

struct PendingAction {
    descriptor: ActionDescriptor,
    operation: EngineOperation,
    reply: Reply,
}

#[derive(Default)]
struct QueueState {
    pending: BTreeMap<SlotKey, PendingAction>,
    next_seq: u64,
    closed: bool,
    stats: QueueStats,
}

struct QueueShared {
    state: Mutex<QueueState>,
    notify: Notify,
    engine: Arc<dyn AnalyticsEngine>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueueShared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 单 worker 的数据库操作队列：所有引擎调用都从这里串行执行
#[derive(Clone)]
pub struct DatabaseActionQueue {
    shared: Arc<QueueShared>,
}

enum Next {
    Run(PendingAction),
    Wait,
    Stop,
}

impl DatabaseActionQueue {
    /// 创建队列并启动常驻 worker（需要在 tokio runtime 内调用）
    pub fn start(engine: Arc<dyn AnalyticsEngine>) -> Self {
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            engine,
            worker: Mutex::new(None),
        });
        let handle = tokio::spawn(run_worker(shared.clone()));
        *shared.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        info!("🚀 Action queue worker started");
        Self { shared }
    }

    /// 同步登记一个操作，返回等待结果的 future。
    ///
    /// 同一 owner 下同名且尚未开始的操作会被新操作取代。
    pub fn submit(
        &self,
        descriptor: ActionDescriptor,
        operation: EngineOperation,
    ) -> BoxFuture<'static, Result<EngineOutput, QueueError>> {
        let (tx, rx) = oneshot::channel();
        let name = operation.name();
        let mut superseded = Vec::new();

        let accepted = {
            let mut state = self.shared.lock();
            if state.closed {
                false
            } else {
                let stale: Vec<SlotKey> = state
                    .pending
                    .iter()
                    .filter(|(_, a)| {
                        a.descriptor.owner_id == descriptor.owner_id && a.operation.name() == name
                    })
                    .map(|(k, _)| *k)
                    .collect();
                for key in stale {
                    if let Some(action) = state.pending.remove(&key) {
                        state.stats.superseded += 1;
                        superseded.push(action);
                    }
                }

                let seq = state.next_seq;
                state.next_seq += 1;
                debug!(
                    "📥 enqueue [{}] {} for {} ({:?})",
                    seq, name, descriptor.owner_id, descriptor.priority
                );
                state.pending.insert(
                    SlotKey {
                        priority: Reverse(descriptor.priority),
                        seq,
                    },
                    PendingAction {
                        descriptor,
                        operation,
                        reply: tx,
                    },
                );
                true
            }
        };

        for action in superseded {
            debug!(
                "⏭ superseded {} for {}",
                name, action.descriptor.owner_id
            );
            let _ = action.reply.send(Err(QueueError::Superseded {
                owner_id: action.descriptor.owner_id.clone(),
                operation: name,
            }));
        }

        if accepted {
            self.shared.notify.notify_one();
        } else {
            warn!("⚠ 队列已关闭，拒绝操作: {}", name);
        }

        async move {
            if !accepted {
                return Err(QueueError::Closed);
            }
            rx.await.unwrap_or(Err(QueueError::Closed))
        }
        .boxed()
    }

    pub async fn enqueue(
        &self,
        descriptor: ActionDescriptor,
        operation: EngineOperation,
    ) -> Result<EngineOutput, QueueError> {
        self.submit(descriptor, operation).await
    }

    /// 把某个 owner 的待执行操作提升到指定优先级，保留入队序号。
    /// 返回被提升的数量。
    pub fn prioritize(&self, owner_id: &str, priority: QueuePriority) -> usize {
        let mut state = self.shared.lock();
        let keys: Vec<SlotKey> = state
            .pending
            .iter()
            .filter(|(k, a)| a.descriptor.owner_id == owner_id && k.priority.0 < priority)
            .map(|(k, _)| *k)
            .collect();
        for key in &keys {
            if let Some(mut action) = state.pending.remove(key) {
                action.descriptor.priority = priority;
                state.pending.insert(
                    SlotKey {
                        priority: Reverse(priority),
                        seq: key.seq,
                    },
                    action,
                );
            }
        }
        if !keys.is_empty() {
            debug!("⬆ prioritized {} action(s) for {}", keys.len(), owner_id);
        }
        keys.len()
    }

    /// 取消某个 owner 所有尚未开始的操作
    pub fn cancel_owner(&self, owner_id: &str) -> usize {
        let cancelled: Vec<PendingAction> = {
            let mut state = self.shared.lock();
            let keys: Vec<SlotKey> = state
                .pending
                .iter()
                .filter(|(_, a)| a.descriptor.owner_id == owner_id)
                .map(|(k, _)| *k)
                .collect();
            let removed: Vec<PendingAction> = keys
                .iter()
                .filter_map(|k| state.pending.remove(k))
                .collect();
            state.stats.cancelled += removed.len();
            removed
        };
        let count = cancelled.len();
        for action in cancelled {
            let _ = action.reply.send(Err(QueueError::Cancelled {
                owner_id: owner_id.to_string(),
            }));
        }
        if count > 0 {
            info!("🛑 cancelled {} pending action(s) for {}", count, owner_id);
        }
        count
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.shared.lock();
        QueueStats {
            pending: state.pending.len(),
            ..state.stats
        }
    }

    /// 关闭队列：拒绝剩余操作并等待 worker 退出
    pub async fn shutdown(&self) {
        let drained: Vec<PendingAction> = {
            let mut state = self.shared.lock();
            state.closed = true;
            std::mem::take(&mut state.pending).into_values().collect()
        };
        for action in drained {
            let _ = action.reply.send(Err(QueueError::Closed));
        }
        self.shared.notify.notify_one();

        let handle = self
            .shared
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("❌ Action queue worker 异常退出: {}", e);
            }
        }
        info!("Action queue stopped");
    }
}

async fn run_worker(shared: Arc<QueueShared>) {
    loop {
        let next = {
            let mut state = shared.lock();
            if let Some((_, action)) = state.pending.pop_first() {
                state.stats.running += 1;
                Next::Run(action)
            } else if state.closed {
                Next::Stop
            } else {
                Next::Wait
            }
        };

        let action = match next {
            Next::Run(action) => action,
            Next::Wait => {
                shared.notify.notified().await;
                continue;
            }
            Next::Stop => break,
        };

        let PendingAction {
            descriptor,
            operation,
            reply,
        } = action;
        let name = operation.name();
        debug!("▶ running {} for {}", name, descriptor.owner_id);

        let engine = shared.engine.clone();
        let outcome = match AssertUnwindSafe(engine.execute(&operation))
            .catch_unwind()
            .await
        {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => {
                warn!("✗ {} for {} failed: {}", name, descriptor.owner_id, e);
                Err(QueueError::Query(e))
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!("❌ {} for {} panicked: {}", name, descriptor.owner_id, msg);
                Err(QueueError::Panicked(msg))
            }
        };

        {
            let mut state = shared.lock();
            state.stats.running -= 1;
            if outcome.is_ok() {
                state.stats.completed += 1;
            } else {
                state.stats.failed += 1;
            }
        }

        if reply.send(outcome).is_err() {
            debug!("caller of {} for {} went away", name, descriptor.owner_id);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::QueryError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{mpsc, Semaphore};

    /// 每次执行都要拿到一个许可，便于测试控制执行时机
    struct GatedEngine {
        gate: Semaphore,
        started: mpsc::UnboundedSender<String>,
        executed: Mutex<Vec<String>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl GatedEngine {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let engine = Arc::new(Self {
                gate: Semaphore::new(0),
                started: tx,
                executed: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            });
            (engine, rx)
        }

        fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    fn label(op: &EngineOperation) -> String {
        match op {
            EngineOperation::RunQuery { sql, .. } => sql.clone(),
            EngineOperation::Execute { sql } => sql.clone(),
            EngineOperation::ValidateExpression { expression, .. } => expression.clone(),
            other => other.name().to_string(),
        }
    }

    #[async_trait]
    impl AnalyticsEngine for GatedEngine {
        async fn execute(&self, op: &EngineOperation) -> Result<EngineOutput, QueryError> {
            let label = label(op);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            let _ = self.started.send(label.clone());
            self.gate.acquire().await.unwrap().forget();
            self.executed.lock().unwrap().push(label.clone());
            self.active.fetch_sub(1, Ordering::SeqCst);
            if label.starts_with("panic") {
                panic!("boom in {}", label);
            }
            if label.starts_with("fail") {
                return Err(QueryError::Database(format!("{} rejected", label)));
            }
            Ok(EngineOutput::Done)
        }
    }

    fn query(sql: &str) -> EngineOperation {
        EngineOperation::RunQuery {
            sql: sql.to_string(),
            args: vec![],
        }
    }

    fn statement(sql: &str) -> EngineOperation {
        EngineOperation::Execute {
            sql: sql.to_string(),
        }
    }

    fn validate(expression: &str) -> EngineOperation {
        EngineOperation::ValidateExpression {
            table_name: "t".to_string(),
            expression: expression.to_string(),
        }
    }

    fn desc(owner: &str, priority: QueuePriority) -> ActionDescriptor {
        ActionDescriptor::new(owner, priority)
    }

    /// 先让一个操作占住 worker，后续操作都会停在 pending
    async fn occupy(
        queue: &DatabaseActionQueue,
        started: &mut mpsc::UnboundedReceiver<String>,
    ) -> BoxFuture<'static, Result<EngineOutput, QueueError>> {
        let blocker = queue.submit(desc("blocker", QueuePriority::Inactive), query("block"));
        assert_eq!(started.recv().await.unwrap(), "block");
        blocker
    }

    #[tokio::test]
    async fn test_same_owner_and_operation_runs_once() {
        let (engine, mut started) = GatedEngine::new();
        let queue = DatabaseActionQueue::start(engine.clone());
        let blocker = occupy(&queue, &mut started).await;

        let first = queue.submit(desc("def-1", QueuePriority::ActiveEntity), validate("sum(a)"));
        let second = queue.submit(desc("def-1", QueuePriority::ActiveEntity), validate("sum(b)"));
        engine.gate.add_permits(10);

        assert!(first.await.unwrap_err().is_superseded());
        assert_eq!(second.await.unwrap(), EngineOutput::Done);
        blocker.await.unwrap();

        assert_eq!(engine.executed(), vec!["block", "sum(b)"]);
        let stats = queue.stats();
        assert_eq!(stats.superseded, 1);
        assert_eq!(stats.completed, 2);
    }

    #[tokio::test]
    async fn test_running_action_is_not_superseded() {
        let (engine, mut started) = GatedEngine::new();
        let queue = DatabaseActionQueue::start(engine.clone());

        let running = queue.submit(desc("m", QueuePriority::Background), query("q1"));
        assert_eq!(started.recv().await.unwrap(), "q1");
        let newer = queue.submit(desc("m", QueuePriority::Background), query("q2"));
        engine.gate.add_permits(2);

        assert_eq!(running.await.unwrap(), EngineOutput::Done);
        assert_eq!(newer.await.unwrap(), EngineOutput::Done);
        assert_eq!(engine.executed(), vec!["q1", "q2"]);
    }

    #[tokio::test]
    async fn test_priority_order() {
        let (engine, mut started) = GatedEngine::new();
        let queue = DatabaseActionQueue::start(engine.clone());
        let blocker = occupy(&queue, &mut started).await;

        let low = queue.submit(desc("x", QueuePriority::Inactive), query("inactive"));
        let mid = queue.submit(desc("y", QueuePriority::Background), query("background"));
        let high = queue.submit(desc("z", QueuePriority::ActiveEntity), query("active"));
        engine.gate.add_permits(4);

        for fut in [blocker, low, mid, high] {
            fut.await.unwrap();
        }
        assert_eq!(
            engine.executed(),
            vec!["block", "active", "background", "inactive"]
        );
    }

    #[tokio::test]
    async fn test_prioritize_keeps_relative_order() {
        let (engine, mut started) = GatedEngine::new();
        let queue = DatabaseActionQueue::start(engine.clone());
        let blocker = occupy(&queue, &mut started).await;

        let a1 = queue.submit(desc("a", QueuePriority::ActiveEntity), query("a1"));
        let b1 = queue.submit(desc("b", QueuePriority::Background), query("b1"));
        let b2 = queue.submit(desc("b", QueuePriority::Background), statement("b2"));
        let c1 = queue.submit(desc("c", QueuePriority::ActiveEntity), query("c1"));

        assert_eq!(queue.prioritize("b", QueuePriority::ActiveEntity), 2);
        // 已经在目标优先级的不再变动
        assert_eq!(queue.prioritize("a", QueuePriority::Background), 0);
        engine.gate.add_permits(5);

        for fut in [blocker, a1, b1, b2, c1] {
            fut.await.unwrap();
        }
        assert_eq!(engine.executed(), vec!["block", "a1", "b1", "b2", "c1"]);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_worker() {
        let (engine, mut started) = GatedEngine::new();
        let queue = DatabaseActionQueue::start(engine.clone());
        let blocker = occupy(&queue, &mut started).await;

        let failing = queue.submit(desc("f", QueuePriority::Background), query("fail-1"));
        let panicking = queue.submit(desc("p", QueuePriority::Background), query("panic-1"));
        let healthy = queue.submit(desc("h", QueuePriority::Background), query("ok-1"));
        engine.gate.add_permits(4);

        blocker.await.unwrap();
        assert!(matches!(
            failing.await,
            Err(QueueError::Query(QueryError::Database(_)))
        ));
        assert!(matches!(panicking.await, Err(QueueError::Panicked(_))));
        assert_eq!(healthy.await.unwrap(), EngineOutput::Done);

        let stats = queue.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.running, 0);
    }

    #[tokio::test]
    async fn test_one_operation_at_a_time() {
        let (engine, _started) = GatedEngine::new();
        let queue = DatabaseActionQueue::start(engine.clone());

        let futs: Vec<_> = (0..5)
            .map(|i| {
                queue.submit(
                    desc(&format!("o{}", i), QueuePriority::Background),
                    query(&format!("q{}", i)),
                )
            })
            .collect();
        engine.gate.add_permits(5);
        for fut in futs {
            fut.await.unwrap();
        }
        assert_eq!(engine.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(engine.executed(), vec!["q0", "q1", "q2", "q3", "q4"]);
    }

    #[tokio::test]
    async fn test_cancel_owner_and_shutdown() {
        let (engine, mut started) = GatedEngine::new();
        let queue = DatabaseActionQueue::start(engine.clone());
        let blocker = occupy(&queue, &mut started).await;

        let doomed = queue.submit(desc("gone", QueuePriority::Background), query("g1"));
        let kept = queue.submit(desc("stay", QueuePriority::Background), query("s1"));
        assert_eq!(queue.cancel_owner("gone"), 1);
        assert!(matches!(doomed.await, Err(QueueError::Cancelled { .. })));

        engine.gate.add_permits(2);
        blocker.await.unwrap();
        kept.await.unwrap();

        queue.shutdown().await;
        let late = queue.submit(desc("late", QueuePriority::Background), query("l1"));
        assert_eq!(late.await, Err(QueueError::Closed));
        assert_eq!(queue.stats().cancelled, 1);
    }
}
