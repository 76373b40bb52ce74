//! 沙箱 worker 消息协议
//!
//! 三类消息形态：一问一答（执行代码、写二进制、列文件、重置）、
//! 同 id 穿插的 STDOUT 流式片段、以及无请求方的初始化/生命周期事件。
//! 硬 ERROR 表示 worker 级不可恢复故障；单个请求的失败走 RESPONSE{success:false}。

use serde::{Deserialize, Serialize};

/// 执行前写入沙箱的输入数据集
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub records: serde_json::Value,
}

/// 协议消息（wire 格式按 type 字段区分）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    #[serde(rename = "INIT_REQUEST")]
    InitRequest,

    #[serde(rename = "INIT_SUCCESS")]
    InitSuccess,

    #[serde(rename = "RUN_REQUEST")]
    RunRequest {
        code: String,
        #[serde(default)]
        datasets: Vec<Dataset>,
        id: String,
    },

    /// 一问一答的终端响应；data 携带请求相关的附加载荷（如执行后的文件清单）
    #[serde(rename = "RESPONSE")]
    Response {
        success: bool,
        #[serde(default)]
        data: serde_json::Value,
        #[serde(default)]
        result: Option<String>,
        id: String,
    },

    /// 与某次 RUN_REQUEST 同 id 的流式部分输出（stdout 透传）
    #[serde(rename = "STDOUT")]
    Stdout { content: String, id: String },

    #[serde(rename = "LIST_FILES")]
    ListFiles { id: String },

    #[serde(rename = "LIST_FILES_RESPONSE")]
    ListFilesResponse { files: Vec<String>, id: String },

    #[serde(rename = "RESET_REQUEST")]
    ResetRequest { id: String },

    #[serde(rename = "RESET_SUCCESS")]
    ResetSuccess { id: String },

    #[serde(rename = "WRITE_BINARY_FILE")]
    WriteBinaryFile {
        file_name: String,
        data: Vec<u8>,
        id: String,
    },

    #[serde(rename = "EXTRACT_TEXT_REQUEST")]
    ExtractTextRequest { file_name: String, id: String },

    /// worker 级不可恢复故障
    #[serde(rename = "ERROR")]
    Error { error: String },
}

impl WorkerMessage {
    /// 响应类消息携带的关联 id
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            WorkerMessage::Response { id, .. }
            | WorkerMessage::Stdout { id, .. }
            | WorkerMessage::ListFilesResponse { id, .. }
            | WorkerMessage::ResetSuccess { id } => Some(id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_tags() {
        let msg = WorkerMessage::RunRequest {
            code: "print(1)".to_string(),
            datasets: vec![],
            id: "abc".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "RUN_REQUEST");
        assert_eq!(json["id"], "abc");

        let parsed: WorkerMessage = serde_json::from_value(serde_json::json!({
            "type": "RESPONSE", "success": true, "id": "abc"
        }))
        .unwrap();
        assert!(matches!(parsed, WorkerMessage::Response { success: true, .. }));
    }

    #[test]
    fn test_stdout_shares_request_id() {
        let msg = WorkerMessage::Stdout {
            content: "line".to_string(),
            id: "abc".to_string(),
        };
        assert_eq!(msg.correlation_id(), Some("abc"));
    }
}
