//! worker 侧协议处理
//!
//! 进程内的沙箱 worker 任务：持有虚拟文件系统与注入的代码运行时（具体语言运行时
//! 不在本 crate 范围内，由调用方或测试注入），在自己的任务里消费请求消息并回发响应。
//! RUN 期间的 stdout 先于终端 RESPONSE 发出，保证同 id 事件的顺序。

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::sandbox::protocol::{Dataset, WorkerMessage};

/// 沙箱内的虚拟文件系统：worker 独占，桥侧只能通过消息观察
#[derive(Debug, Default)]
pub struct VirtualFs {
    files: BTreeMap<String, Vec<u8>>,
}

impl VirtualFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, name: impl Into<String>, data: Vec<u8>) {
        self.files.insert(name.into(), data);
    }

    pub fn read(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(|v| v.as_slice())
    }

    pub fn list(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }
}

/// 注入的代码运行时：执行一段代码，可向 stdout 通道写部分输出，可读写虚拟文件系统
#[async_trait]
pub trait CodeRuntime: Send {
    async fn run(
        &mut self,
        code: &str,
        fs: &mut VirtualFs,
        stdout: &mpsc::UnboundedSender<String>,
    ) -> Result<String, String>;

    /// 从二进制文档中提取文本（供 read_document 工具）；默认不支持
    async fn extract_text(&mut self, _file_name: &str, _data: &[u8]) -> Result<String, String> {
        Err("text extraction not supported by this runtime".to_string())
    }
}

/// 脚本化运行时：用闭包模拟执行，测试与演示用
pub struct ScriptedRuntime {
    #[allow(clippy::type_complexity)]
    handler: Box<
        dyn FnMut(&str, &mut VirtualFs, &mpsc::UnboundedSender<String>) -> Result<String, String>
            + Send,
    >,
}

impl ScriptedRuntime {
    pub fn new(
        handler: impl FnMut(&str, &mut VirtualFs, &mpsc::UnboundedSender<String>) -> Result<String, String>
            + Send
            + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
        }
    }
}

#[async_trait]
impl CodeRuntime for ScriptedRuntime {
    async fn run(
        &mut self,
        code: &str,
        fs: &mut VirtualFs,
        stdout: &mpsc::UnboundedSender<String>,
    ) -> Result<String, String> {
        (self.handler)(code, fs, stdout)
    }

    async fn extract_text(&mut self, _file_name: &str, data: &[u8]) -> Result<String, String> {
        Ok(String::from_utf8_lossy(data).into_owned())
    }
}

/// 启动进程内 worker 任务，返回（发往 worker 的 tx，来自 worker 的 rx）
pub fn spawn_worker(
    runtime: impl CodeRuntime + 'static,
) -> (
    mpsc::UnboundedSender<WorkerMessage>,
    mpsc::UnboundedReceiver<WorkerMessage>,
) {
    let (to_worker_tx, to_worker_rx) = mpsc::unbounded_channel();
    let (from_worker_tx, from_worker_rx) = mpsc::unbounded_channel();
    tokio::spawn(worker_loop(runtime, to_worker_rx, from_worker_tx));
    (to_worker_tx, from_worker_rx)
}

async fn worker_loop(
    mut runtime: impl CodeRuntime,
    mut inbox: mpsc::UnboundedReceiver<WorkerMessage>,
    outbox: mpsc::UnboundedSender<WorkerMessage>,
) {
    let mut fs = VirtualFs::new();

    while let Some(msg) = inbox.recv().await {
        let reply = match msg {
            WorkerMessage::InitRequest => WorkerMessage::InitSuccess,

            WorkerMessage::RunRequest { code, datasets, id } => {
                run_request(&mut runtime, &mut fs, &outbox, code, datasets, id).await
            }

            WorkerMessage::ListFiles { id } => WorkerMessage::ListFilesResponse {
                files: fs.list(),
                id,
            },

            WorkerMessage::ResetRequest { id } => {
                fs.clear();
                WorkerMessage::ResetSuccess { id }
            }

            WorkerMessage::WriteBinaryFile { file_name, data, id } => {
                fs.write(file_name, data);
                WorkerMessage::Response {
                    success: true,
                    data: serde_json::Value::Null,
                    result: None,
                    id,
                }
            }

            WorkerMessage::ExtractTextRequest { file_name, id } => {
                match fs.read(&file_name).map(|d| d.to_vec()) {
                    Some(data) => match runtime.extract_text(&file_name, &data).await {
                        Ok(text) => WorkerMessage::Response {
                            success: true,
                            data: serde_json::Value::Null,
                            result: Some(text),
                            id,
                        },
                        Err(e) => WorkerMessage::Response {
                            success: false,
                            data: serde_json::Value::Null,
                            result: Some(e),
                            id,
                        },
                    },
                    None => WorkerMessage::Response {
                        success: false,
                        data: serde_json::Value::Null,
                        result: Some(format!("no such file: {}", file_name)),
                        id,
                    },
                }
            }

            // 请求方向不会出现其余变体；忽略而非崩溃
            _ => continue,
        };
        if outbox.send(reply).is_err() {
            break;
        }
    }
}

async fn run_request(
    runtime: &mut impl CodeRuntime,
    fs: &mut VirtualFs,
    outbox: &mpsc::UnboundedSender<WorkerMessage>,
    code: String,
    datasets: Vec<Dataset>,
    id: String,
) -> WorkerMessage {
    // 输入先于执行写入
    for ds in datasets {
        let bytes = serde_json::to_vec(&ds.records).unwrap_or_default();
        fs.write(ds.name, bytes);
    }

    // stdout 经转发任务映射为同 id 的 STDOUT 事件；
    // 等转发任务收尾后再回终端 RESPONSE，保证顺序
    let (stdout_tx, mut stdout_rx) = mpsc::unbounded_channel::<String>();
    let forward_outbox = outbox.clone();
    let forward_id = id.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(content) = stdout_rx.recv().await {
            let _ = forward_outbox.send(WorkerMessage::Stdout {
                content,
                id: forward_id.clone(),
            });
        }
    });

    let outcome = runtime.run(&code, fs, &stdout_tx).await;
    drop(stdout_tx);
    let _ = forwarder.await;

    let files = serde_json::json!({ "files": fs.list() });
    match outcome {
        Ok(result) => WorkerMessage::Response {
            success: true,
            data: files,
            result: Some(result),
            id,
        },
        Err(e) => WorkerMessage::Response {
            success: false,
            data: files,
            result: Some(e),
            id,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_worker_run_streams_stdout_before_response() {
        let runtime = ScriptedRuntime::new(|code, _fs, stdout| {
            stdout.send("step 1".to_string()).ok();
            stdout.send("step 2".to_string()).ok();
            Ok(format!("ran {} bytes", code.len()))
        });
        let (tx, mut rx) = spawn_worker(runtime);
        tx.send(WorkerMessage::RunRequest {
            code: "x = 1".to_string(),
            datasets: vec![],
            id: "r1".to_string(),
        })
        .unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, WorkerMessage::Stdout { ref content, .. } if content == "step 1"));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, WorkerMessage::Stdout { ref content, .. } if content == "step 2"));
        let third = rx.recv().await.unwrap();
        assert!(matches!(third, WorkerMessage::Response { success: true, .. }));
    }

    #[tokio::test]
    async fn test_worker_reset_clears_fs() {
        let runtime = ScriptedRuntime::new(|_, fs, _| {
            fs.write("out.csv", b"a,b".to_vec());
            Ok("ok".to_string())
        });
        let (tx, mut rx) = spawn_worker(runtime);
        tx.send(WorkerMessage::RunRequest {
            code: String::new(),
            datasets: vec![],
            id: "r1".to_string(),
        })
        .unwrap();
        // RESPONSE
        let resp = rx.recv().await.unwrap();
        match resp {
            WorkerMessage::Response { data, .. } => {
                assert_eq!(data["files"][0], "out.csv");
            }
            other => panic!("unexpected: {:?}", other),
        }

        tx.send(WorkerMessage::ResetRequest { id: "r2".to_string() }).unwrap();
        assert!(matches!(rx.recv().await.unwrap(), WorkerMessage::ResetSuccess { .. }));

        tx.send(WorkerMessage::ListFiles { id: "r3".to_string() }).unwrap();
        match rx.recv().await.unwrap() {
            WorkerMessage::ListFilesResponse { files, .. } => assert!(files.is_empty()),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
