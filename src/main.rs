//! Weaver - 数据/文档智能体编排核心
//!
//! 入口：初始化日志与配置，装配沙箱、审计器与编排器，跑一次完整会话并输出报告。
//! 设置 OPENAI_API_KEY 时走真实端点，否则用内置脚本演示完整链路
//! （编排 -> 委派 -> 审计 -> 沙箱执行 -> 汇总）。

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use weaver::agent::{AgentEvent, Auditor, LoopConfig, LoopController};
use weaver::config::load_config;
use weaver::llm::{LlmClient, LlmReply, MockLlmClient, OpenAiClient};
use weaver::orchestrator::{LoopDelegate, Orchestrator, OrchestratorConfig};
use weaver::privacy::Masker;
use weaver::sandbox::{spawn_worker, RpcTimeouts, SandboxBridge, ScriptedRuntime};
use weaver::tools::{
    ListFilesTool, ReadDocumentTool, ResetSandboxTool, RunCodeTool, ToolExecutor, ToolRegistry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    weaver::observability::init();

    let config = load_config(None).context("Failed to load config")?;
    let cancel = CancellationToken::new();

    // 补全端点：有 API key 走真实端点，否则用演示脚本
    let use_real_endpoint = std::env::var("OPENAI_API_KEY").is_ok();
    let (agent_llm, auditor_llm): (Arc<dyn LlmClient>, Arc<dyn LlmClient>) = if use_real_endpoint {
        let client = Arc::new(OpenAiClient::new(
            config.llm.base_url.as_deref(),
            &config.llm.model,
            None,
        ));
        (Arc::clone(&client) as Arc<dyn LlmClient>, client)
    } else {
        tracing::info!("OPENAI_API_KEY 未设置，使用内置演示脚本");
        (demo_agent_script(), demo_auditor_script())
    };

    // 沙箱：进程内 worker + RPC 桥（真实部署换成进程/容器级 worker）
    let (to_worker, from_worker) = spawn_worker(demo_runtime());
    let bridge = Arc::new(SandboxBridge::new(
        to_worker,
        from_worker,
        RpcTimeouts::from_secs(
            config.sandbox.exec_timeout_secs,
            config.sandbox.query_timeout_secs,
        ),
        cancel.clone(),
    ));
    bridge.init().await.context("Sandbox init failed")?;

    let auditor = Arc::new(Auditor::new(
        Arc::clone(&auditor_llm),
        config.audit.sandbox_root.clone(),
    ));

    // 过程事件：打印到终端（前端可改为 WebSocket 推送）
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<AgentEvent>();
    let printer = tokio::spawn(async move {
        while let Some(ev) = event_rx.recv().await {
            match serde_json::to_string(&ev) {
                Ok(line) => println!("[event] {}", line),
                Err(e) => tracing::warn!(error = %e, "event serialize failed"),
            }
        }
    });

    let loop_config = LoopConfig {
        max_turns: config.app.max_turns,
        rejection_ceiling: config.app.rejection_ceiling,
    };
    let make_controller = |bridge: Arc<SandboxBridge>| {
        // 代码执行期间的 stdout 透传为 PartialOutput 事件
        let (stdout_tx, mut stdout_rx) = mpsc::unbounded_channel::<String>();
        let partial_event_tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(content) = stdout_rx.recv().await {
                let _ = partial_event_tx.send(AgentEvent::PartialOutput { content });
            }
        });
        let mut registry = ToolRegistry::new();
        registry.register(RunCodeTool::new(Arc::clone(&bridge), Some(stdout_tx)));
        registry.register(ListFilesTool::new(Arc::clone(&bridge)));
        registry.register(ReadDocumentTool::new(Arc::clone(&bridge)));
        registry.register(ResetSandboxTool::new(Arc::clone(&bridge)));
        let executor = Arc::new(ToolExecutor::new(registry, config.sandbox.exec_timeout_secs));
        LoopController::new(
            Arc::clone(&agent_llm),
            Arc::clone(&auditor),
            executor,
            masker_from(&config),
            cancel.clone(),
        )
        .with_snapshot(bridge)
        .with_config(loop_config.clone())
        .with_event_tx(event_tx.clone())
    };

    // 两类专职循环共享同一个沙箱会话；委派串行，状态互见
    let delegate = Arc::new(LoopDelegate::new(
        make_controller(Arc::clone(&bridge)),
        make_controller(Arc::clone(&bridge)),
    ));

    let mut orchestrator = Orchestrator::new(
        agent_llm,
        auditor,
        delegate,
        masker_from(&config),
        cancel.clone(),
    )
    .with_config(OrchestratorConfig {
        max_turns: config.orchestrator.max_turns,
    })
    .with_event_tx(event_tx.clone());
    drop(event_tx);

    let prompt = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "核对 /mnt 下两张账目表的金额是否一致".to_string());

    let outcome = orchestrator.run(&prompt).await.context("Session failed")?;
    // 释放控制器链上的事件发送端，事件通道关闭后打印任务才会收尾
    drop(orchestrator);
    printer.await.ok();

    println!();
    match &outcome.final_report {
        Some(report) => println!("最终报告：{}", report),
        None => println!(
            "会话未完成：{}",
            outcome.error.as_deref().unwrap_or("unknown")
        ),
    }
    println!(
        "编排步骤：\n{}",
        serde_json::to_string_pretty(&outcome.steps).context("Steps export failed")?
    );

    Ok(())
}

fn masker_from(config: &weaver::config::AppConfig) -> Masker {
    if config.privacy.enabled {
        Masker::new(
            config.privacy.skip_words.clone(),
            config.privacy.preserve_keys.clone(),
        )
    } else {
        Masker::disabled()
    }
}

/// 演示运行时：把任何代码请求当作「对账」，写出一个结果文件
fn demo_runtime() -> ScriptedRuntime {
    ScriptedRuntime::new(|code, fs, stdout| {
        let _ = stdout.send(format!("executing {} bytes of code...\n", code.len()));
        fs.write("对账结果.csv", b"row,match\n1,true\n2,true\n".to_vec());
        Ok("2 行核对完成，全部一致".to_string())
    })
}

/// 演示脚本：编排器委派一次表格子任务，子循环跑一次代码后收尾
fn demo_agent_script() -> Arc<dyn LlmClient> {
    Arc::new(MockLlmClient::scripted([
        // 编排第 1 轮：委派
        r#"{"thought":"这是表格核对任务，交给表格智能体","action":{"tool":"delegate-to-spreadsheet-agent","params":{"instruction":"读取 /mnt 下的账目表并逐行核对金额"}}}"#,
        // 子循环第 1 轮：执行代码
        r#"{"thought":"先跑核对脚本","action":{"tool":"run_code","params":{"code":"reconcile('/mnt')"}}}"#,
        // 子循环第 2 轮：收尾
        r#"{"thought":"核对完成","action":{"tool":"finish","params":{"message":"两张账目表金额逐行一致"}}}"#,
        // 编排第 2 轮：汇总
        r#"{"thought":"子任务已完成，汇总","action":{"tool":"finish","params":{"message":"核对完毕：两张账目表金额一致，结果见 对账结果.csv"}}}"#,
    ]))
}

/// 演示审计：全部批准
fn demo_auditor_script() -> Arc<dyn LlmClient> {
    let llm = MockLlmClient::new();
    for _ in 0..16 {
        llm.push_reply(LlmReply::text(r#"{"approved": true}"#));
    }
    Arc::new(llm)
}
