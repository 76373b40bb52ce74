//! 沙箱 RPC 桥
//!
//! 每个会话独占一个长生命周期的隔离执行 worker。每个请求带新鲜关联 id，
//! 发出前先登记进 pending 表，worker 的回复按 id 解复用；同 id 的 STDOUT
//! 事件累积进 pending 条目并转发给订阅者。按请求类型区分的有界超时保证
//! 卡死的 worker 不会让 pending 条目永久悬挂：超时即移除条目并拒绝调用方。
//! 每个 pending 条目恰好被 {响应, 超时拒绝, 取消拒绝} 之一了结一次。
//!
//! 桥是沙箱文件状态的唯一拥有者：known_files 集合、dirty 重同步标志、
//! 执行后新出现文件的 generated_files 上报都在这里。执行请求不流水线化，
//! 同一 worker 同时只有一个执行在飞（列目录等元数据请求可并行）。

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::sandbox::protocol::{Dataset, WorkerMessage};

/// 按请求类型区分的超时：列目录短，执行代码长
#[derive(Debug, Clone)]
pub struct RpcTimeouts {
    pub exec: Duration,
    pub query: Duration,
}

impl Default for RpcTimeouts {
    fn default() -> Self {
        Self {
            exec: Duration::from_secs(120),
            query: Duration::from_secs(10),
        }
    }
}

impl RpcTimeouts {
    pub fn from_secs(exec_secs: u64, query_secs: u64) -> Self {
        Self {
            exec: Duration::from_secs(exec_secs),
            query: Duration::from_secs(query_secs),
        }
    }
}

/// 一次代码执行的结果
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub success: bool,
    pub result: Option<String>,
    /// 执行期间累积的全部 stdout
    pub stdout: String,
    /// 执行后新出现、此前未知的文件（编排层据此追踪非显式创建的产物）
    pub generated_files: Vec<String>,
}

/// 在飞请求：从发出到终端响应或超时为止存活于关联表
struct Pending {
    resolve: oneshot::Sender<(WorkerMessage, String)>,
    partial_tx: Option<mpsc::UnboundedSender<String>>,
    accumulated: String,
}

struct Shared {
    pending: StdMutex<HashMap<String, Pending>>,
    alive: AtomicBool,
    init_notify: Notify,
    /// fail_all 的原因，pending 被整体拒绝时供调用方区分取消与故障
    fail_reason: StdMutex<Option<String>>,
}

impl Shared {
    /// 拒绝所有在飞请求（worker 故障或取消时）；丢弃 resolver 即让调用方出错返回
    fn fail_all(&self, reason: &str) {
        *self.fail_reason.lock().unwrap() = Some(reason.to_string());
        self.pending.lock().unwrap().clear();
    }
}

/// 沙箱 RPC 桥：控制线程与 worker 之间唯一的通道
pub struct SandboxBridge {
    to_worker: mpsc::UnboundedSender<WorkerMessage>,
    shared: Arc<Shared>,
    known_files: StdMutex<BTreeSet<String>>,
    dirty: AtomicBool,
    exec_lock: tokio::sync::Mutex<()>,
    timeouts: RpcTimeouts,
}

impl SandboxBridge {
    /// 接管与 worker 的双向通道并启动解复用泵。取消信号触发时，
    /// 所有在飞请求都会被拒绝，不留悬挂的 pending 条目。
    pub fn new(
        to_worker: mpsc::UnboundedSender<WorkerMessage>,
        from_worker: mpsc::UnboundedReceiver<WorkerMessage>,
        timeouts: RpcTimeouts,
        cancel: CancellationToken,
    ) -> Self {
        let shared = Arc::new(Shared {
            pending: StdMutex::new(HashMap::new()),
            alive: AtomicBool::new(false),
            init_notify: Notify::new(),
            fail_reason: StdMutex::new(None),
        });
        tokio::spawn(demux_pump(Arc::clone(&shared), from_worker, cancel));
        Self {
            to_worker,
            shared,
            known_files: StdMutex::new(BTreeSet::new()),
            dirty: AtomicBool::new(false),
            exec_lock: tokio::sync::Mutex::new(()),
            timeouts,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Relaxed)
    }

    /// 是否需要完整重同步沙箱文件状态
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    /// 当前已知文件快照（审计器的状态快照也取自这里）
    pub fn known_files(&self) -> Vec<String> {
        self.known_files.lock().unwrap().iter().cloned().collect()
    }

    /// 初始化 worker；INIT_SUCCESS 是无 id 的生命周期事件，单独等待
    pub async fn init(&self) -> Result<(), AgentError> {
        let notified = self.shared.init_notify.notified();
        self.to_worker
            .send(WorkerMessage::InitRequest)
            .map_err(|_| AgentError::WorkerUnavailable)?;
        timeout(self.timeouts.query, notified)
            .await
            .map_err(|_| AgentError::RpcTimeout("INIT_REQUEST".to_string()))?;
        Ok(())
    }

    /// 执行代码。partial 订阅者会实时收到 stdout 片段；返回时附带
    /// 全部累积输出与执行后新出现的文件。
    pub async fn run_code(
        &self,
        code: &str,
        datasets: Vec<Dataset>,
        partial: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<ExecOutcome, AgentError> {
        // 严格一问一答：同一 worker 不流水线化执行请求
        let _guard = self.exec_lock.lock().await;
        let id = uuid::Uuid::new_v4().to_string();
        let request = WorkerMessage::RunRequest {
            code: code.to_string(),
            datasets,
            id: id.clone(),
        };
        let (reply, stdout) = self
            .dispatch(request, &id, self.timeouts.exec, partial)
            .await?;

        match reply {
            WorkerMessage::Response {
                success,
                data,
                result,
                ..
            } => {
                let files: Vec<String> = data
                    .get("files")
                    .and_then(|f| f.as_array())
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                let generated = self.sync_files(&files);
                Ok(ExecOutcome {
                    success,
                    result,
                    stdout,
                    generated_files: generated,
                })
            }
            other => Err(AgentError::WorkerFault(format!(
                "unexpected reply to RUN_REQUEST: {:?}",
                other
            ))),
        }
    }

    /// 执行前写入输入文件；沙箱状态被本侧改动，置 dirty
    pub async fn write_file(&self, file_name: &str, data: Vec<u8>) -> Result<(), AgentError> {
        let id = uuid::Uuid::new_v4().to_string();
        let request = WorkerMessage::WriteBinaryFile {
            file_name: file_name.to_string(),
            data,
            id: id.clone(),
        };
        let (reply, _) = self
            .dispatch(request, &id, self.timeouts.query, None)
            .await?;
        match reply {
            WorkerMessage::Response { success: true, .. } => {
                self.known_files
                    .lock()
                    .unwrap()
                    .insert(file_name.to_string());
                self.dirty.store(true, Ordering::Relaxed);
                Ok(())
            }
            WorkerMessage::Response { result, .. } => Err(AgentError::ToolExecutionFailed(
                result.unwrap_or_else(|| "write failed".to_string()),
            )),
            other => Err(AgentError::WorkerFault(format!(
                "unexpected reply to WRITE_BINARY_FILE: {:?}",
                other
            ))),
        }
    }

    /// 列出沙箱文件并刷新 known_files（完成一次重同步，清掉 dirty）
    pub async fn list_files(&self) -> Result<Vec<String>, AgentError> {
        let id = uuid::Uuid::new_v4().to_string();
        let (reply, _) = self
            .dispatch(
                WorkerMessage::ListFiles { id: id.clone() },
                &id,
                self.timeouts.query,
                None,
            )
            .await?;
        match reply {
            WorkerMessage::ListFilesResponse { files, .. } => {
                self.sync_files(&files);
                self.dirty.store(false, Ordering::Relaxed);
                Ok(files)
            }
            other => Err(AgentError::WorkerFault(format!(
                "unexpected reply to LIST_FILES: {:?}",
                other
            ))),
        }
    }

    /// 提取文档文本
    pub async fn extract_text(&self, file_name: &str) -> Result<String, AgentError> {
        let id = uuid::Uuid::new_v4().to_string();
        let request = WorkerMessage::ExtractTextRequest {
            file_name: file_name.to_string(),
            id: id.clone(),
        };
        let (reply, _) = self
            .dispatch(request, &id, self.timeouts.exec, None)
            .await?;
        match reply {
            WorkerMessage::Response {
                success: true,
                result,
                ..
            } => Ok(result.unwrap_or_default()),
            WorkerMessage::Response { result, .. } => Err(AgentError::ToolExecutionFailed(
                result.unwrap_or_else(|| "extraction failed".to_string()),
            )),
            other => Err(AgentError::WorkerFault(format!(
                "unexpected reply to EXTRACT_TEXT_REQUEST: {:?}",
                other
            ))),
        }
    }

    /// 重置沙箱：清空 worker 侧文件系统与本侧文件追踪
    pub async fn reset(&self) -> Result<(), AgentError> {
        let id = uuid::Uuid::new_v4().to_string();
        let (reply, _) = self
            .dispatch(
                WorkerMessage::ResetRequest { id: id.clone() },
                &id,
                self.timeouts.query,
                None,
            )
            .await?;
        match reply {
            WorkerMessage::ResetSuccess { .. } => {
                self.known_files.lock().unwrap().clear();
                self.dirty.store(false, Ordering::Relaxed);
                Ok(())
            }
            other => Err(AgentError::WorkerFault(format!(
                "unexpected reply to RESET_REQUEST: {:?}",
                other
            ))),
        }
    }

    /// 用 worker 报告的文件清单刷新 known_files，返回此前未知的新文件
    fn sync_files(&self, files: &[String]) -> Vec<String> {
        let mut known = self.known_files.lock().unwrap();
        let generated: Vec<String> = files
            .iter()
            .filter(|f| !known.contains(*f))
            .cloned()
            .collect();
        known.clear();
        known.extend(files.iter().cloned());
        generated
    }

    /// 登记 pending 条目、发出请求并等待终端响应。
    /// 超时即移除条目并拒绝；fail_all 清表时调用方以取消/故障出错返回。
    async fn dispatch(
        &self,
        request: WorkerMessage,
        id: &str,
        duration: Duration,
        partial: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<(WorkerMessage, String), AgentError> {
        if !self.is_alive() {
            return Err(AgentError::WorkerUnavailable);
        }
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(
            id.to_string(),
            Pending {
                resolve: tx,
                partial_tx: partial,
                accumulated: String::new(),
            },
        );
        if self.to_worker.send(request).is_err() {
            self.shared.pending.lock().unwrap().remove(id);
            return Err(AgentError::WorkerUnavailable);
        }

        match timeout(duration, rx).await {
            Ok(Ok(pair)) => Ok(pair),
            Ok(Err(_)) => {
                let reason = self
                    .shared
                    .fail_reason
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_else(|| "pending request dropped".to_string());
                if reason == CANCELLED_REASON {
                    Err(AgentError::Cancelled)
                } else {
                    Err(AgentError::WorkerFault(reason))
                }
            }
            Err(_) => {
                self.shared.pending.lock().unwrap().remove(id);
                Err(AgentError::RpcTimeout(id.to_string()))
            }
        }
    }
}

impl crate::agent::auditor::StateSnapshot for SandboxBridge {
    fn known_files(&self) -> Vec<String> {
        self.known_files()
    }
}

const CANCELLED_REASON: &str = "cancelled";

/// 解复用泵：按 id 派发 worker 回复；STDOUT 累积并转发；
/// 硬 ERROR 或通道关闭时拒绝全部在飞请求并判定 worker 死亡
async fn demux_pump(
    shared: Arc<Shared>,
    mut from_worker: mpsc::UnboundedReceiver<WorkerMessage>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => {
                shared.fail_all(CANCELLED_REASON);
                return;
            }
            msg = from_worker.recv() => msg,
        };
        let Some(msg) = msg else {
            shared.alive.store(false, Ordering::Relaxed);
            shared.fail_all("worker channel closed");
            return;
        };

        match msg {
            WorkerMessage::InitSuccess => {
                shared.alive.store(true, Ordering::Relaxed);
                shared.init_notify.notify_waiters();
            }
            WorkerMessage::Error { error } => {
                tracing::error!(error = %error, "sandbox worker fault");
                shared.alive.store(false, Ordering::Relaxed);
                shared.fail_all(&error);
                return;
            }
            WorkerMessage::Stdout { content, id } => {
                let mut pending = shared.pending.lock().unwrap();
                if let Some(entry) = pending.get_mut(&id) {
                    entry.accumulated.push_str(&content);
                    entry.accumulated.push('\n');
                    if let Some(tx) = &entry.partial_tx {
                        let _ = tx.send(content);
                    }
                }
                // 超时后迟到的 STDOUT：条目已移除，按至多一次语义丢弃
            }
            other => {
                let Some(id) = other.correlation_id().map(str::to_string) else {
                    tracing::warn!(message = ?other, "uncorrelated worker message dropped");
                    continue;
                };
                let entry = shared.pending.lock().unwrap().remove(&id);
                match entry {
                    Some(entry) => {
                        let accumulated = entry.accumulated;
                        let _ = entry.resolve.send((other, accumulated));
                    }
                    // 超时后迟到的响应：调用方已被拒绝，丢弃
                    None => tracing::warn!(id = %id, "late reply for resolved request"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::worker::{spawn_worker, ScriptedRuntime};

    fn quick_timeouts() -> RpcTimeouts {
        RpcTimeouts {
            exec: Duration::from_secs(5),
            query: Duration::from_secs(5),
        }
    }

    async fn ready_bridge(runtime: ScriptedRuntime) -> SandboxBridge {
        let (tx, rx) = spawn_worker(runtime);
        let bridge = SandboxBridge::new(tx, rx, quick_timeouts(), CancellationToken::new());
        bridge.init().await.unwrap();
        bridge
    }

    #[tokio::test]
    async fn test_run_code_accumulates_stdout() {
        let bridge = ready_bridge(ScriptedRuntime::new(|_, _, stdout| {
            stdout.send("a".to_string()).ok();
            stdout.send("b".to_string()).ok();
            Ok("result".to_string())
        }))
        .await;

        let (ptx, mut prx) = mpsc::unbounded_channel();
        let outcome = bridge.run_code("x", vec![], Some(ptx)).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.result.as_deref(), Some("result"));
        assert_eq!(outcome.stdout, "a\nb\n");
        assert_eq!(prx.recv().await.as_deref(), Some("a"));
        assert_eq!(prx.recv().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_newly_generated_file_reported() {
        let bridge = ready_bridge(ScriptedRuntime::new(|code, fs, _| {
            if code.contains("to_excel") {
                fs.write("out.xlsx", vec![1, 2, 3]);
            }
            Ok("ok".to_string())
        }))
        .await;

        bridge.write_file("in.xlsx", vec![0]).await.unwrap();
        assert!(bridge.is_dirty());

        let outcome = bridge
            .run_code("df.to_excel('/mnt/out.xlsx')", vec![], None)
            .await
            .unwrap();
        assert_eq!(outcome.generated_files, vec!["out.xlsx".to_string()]);

        // 第二次执行同一文件不再是"新"文件
        let outcome = bridge
            .run_code("df.to_excel('/mnt/out.xlsx')", vec![], None)
            .await
            .unwrap();
        assert!(outcome.generated_files.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_rejects_and_removes_pending() {
        // 永不回复的 worker：只吞 INIT 之外的消息
        let (to_tx, mut to_rx) = mpsc::unbounded_channel::<WorkerMessage>();
        let (from_tx, from_rx) = mpsc::unbounded_channel::<WorkerMessage>();
        tokio::spawn(async move {
            while let Some(msg) = to_rx.recv().await {
                if matches!(msg, WorkerMessage::InitRequest) {
                    from_tx.send(WorkerMessage::InitSuccess).unwrap();
                }
            }
        });
        let bridge = SandboxBridge::new(
            to_tx,
            from_rx,
            RpcTimeouts {
                exec: Duration::from_millis(50),
                query: Duration::from_millis(50),
            },
            CancellationToken::new(),
        );
        bridge.init().await.unwrap();

        let err = bridge.list_files().await.unwrap_err();
        assert!(matches!(err, AgentError::RpcTimeout(_)));
        assert!(bridge.shared.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_worker_error_rejects_in_flight() {
        let (to_tx, mut to_rx) = mpsc::unbounded_channel::<WorkerMessage>();
        let (from_tx, from_rx) = mpsc::unbounded_channel::<WorkerMessage>();
        tokio::spawn(async move {
            while let Some(msg) = to_rx.recv().await {
                match msg {
                    WorkerMessage::InitRequest => {
                        from_tx.send(WorkerMessage::InitSuccess).unwrap();
                    }
                    WorkerMessage::RunRequest { .. } => {
                        from_tx
                            .send(WorkerMessage::Error {
                                error: "interpreter crashed".to_string(),
                            })
                            .unwrap();
                    }
                    _ => {}
                }
            }
        });
        let bridge = SandboxBridge::new(to_tx, from_rx, quick_timeouts(), CancellationToken::new());
        bridge.init().await.unwrap();

        let err = bridge.run_code("boom", vec![], None).await.unwrap_err();
        assert!(matches!(err, AgentError::WorkerFault(_)));
        assert!(!bridge.is_alive());
        // worker 死亡后的新请求直接拒绝
        assert!(matches!(
            bridge.list_files().await.unwrap_err(),
            AgentError::WorkerUnavailable
        ));
    }

    #[tokio::test]
    async fn test_cancellation_rejects_in_flight() {
        let (to_tx, mut to_rx) = mpsc::unbounded_channel::<WorkerMessage>();
        let (from_tx, from_rx) = mpsc::unbounded_channel::<WorkerMessage>();
        tokio::spawn(async move {
            while let Some(msg) = to_rx.recv().await {
                if matches!(msg, WorkerMessage::InitRequest) {
                    from_tx.send(WorkerMessage::InitSuccess).unwrap();
                }
            }
        });
        let cancel = CancellationToken::new();
        let bridge = Arc::new(SandboxBridge::new(
            to_tx,
            from_rx,
            quick_timeouts(),
            cancel.clone(),
        ));
        bridge.init().await.unwrap();

        let b = Arc::clone(&bridge);
        let call = tokio::spawn(async move { b.run_code("slow", vec![], None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }
}
