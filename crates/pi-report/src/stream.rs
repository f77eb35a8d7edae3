//! 流式报告
//!
//! 上游推理片段先写入缓冲区，超过阈值或遇到空行时整块推送；
//! 无论正常结束、上游出错还是被取消，最后都推送一个完成块。

use once_cell::sync::Lazy;
use pi_core::ReportChunk;
use pi_error::{PiError, Result};
use pi_llm::PredictResponse;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

static COMPLETE_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^#{1,6}[ \t]+([^\n]+?)[ \t#]*\n").unwrap());

/// 缓冲区超过阈值字节或以空行结尾时推送
pub fn should_flush(buffer: &str, threshold: usize) -> bool {
    buffer.len() > threshold || buffer.ends_with("\n\n")
}

/// 文本中最后一个完整的 Markdown 标题
pub fn detect_section_hint(text: &str) -> Option<String> {
    COMPLETE_HEADING
        .captures_iter(text)
        .last()
        .map(|caps| caps[1].trim().to_string())
}

/// 单个流的切块状态
#[derive(Debug)]
pub struct ChunkAssembler {
    report_id: Uuid,
    threshold: usize,
    sequence: usize,
    buffer: String,
    hint: Option<String>,
}

impl ChunkAssembler {
    pub fn new(report_id: Uuid, threshold: usize) -> Self {
        Self {
            report_id,
            threshold,
            sequence: 0,
            buffer: String::new(),
            hint: None,
        }
    }

    /// 追加一个片段，需要推送时返回整块
    pub fn push(&mut self, piece: &str) -> Option<ReportChunk> {
        self.buffer.push_str(piece);
        if let Some(hint) = detect_section_hint(&self.buffer) {
            self.hint = Some(hint);
        }
        if should_flush(&self.buffer, self.threshold) {
            Some(self.emit(false))
        } else {
            None
        }
    }

    /// 取出剩余内容作为完成块
    pub fn finish(&mut self) -> ReportChunk {
        self.emit(true)
    }

    fn emit(&mut self, is_complete: bool) -> ReportChunk {
        let chunk = ReportChunk {
            report_id: self.report_id,
            sequence: self.sequence,
            content: std::mem::take(&mut self.buffer),
            section_hint: self.hint.clone(),
            is_complete,
        };
        self.sequence += 1;
        chunk
    }
}

/// 流结束时的汇总
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub report_id: Uuid,
    pub full_text: String,
    pub chunks_sent: usize,
    pub cancelled: bool,
    pub error: Option<PiError>,
}

/// 流式报告句柄：逐块读取，结束后可取得汇总
pub struct ReportStream {
    report_id: Uuid,
    receiver: mpsc::Receiver<ReportChunk>,
    handle: JoinHandle<StreamOutcome>,
}

impl ReportStream {
    pub fn report_id(&self) -> Uuid {
        self.report_id
    }

    /// 下一个块；完成块之后返回 `None`
    pub async fn next_chunk(&mut self) -> Option<ReportChunk> {
        self.receiver.recv().await
    }

    /// 读完剩余块并等待生产任务结束
    pub async fn finish(mut self) -> Result<StreamOutcome> {
        while self.receiver.recv().await.is_some() {}
        Ok(self.handle.await?)
    }
}

/// 流结束后的回调，用于记录指标
pub type CompletionHook = Box<dyn FnOnce(&StreamOutcome) + Send + 'static>;

/// 启动生产任务，把上游片段整理成报告块
pub fn spawn_report_stream(
    mut upstream: mpsc::Receiver<Result<PredictResponse>>,
    report_id: Uuid,
    flush_threshold: usize,
    buffer_size: usize,
    cancel: CancellationToken,
    on_complete: Option<CompletionHook>,
) -> ReportStream {
    let (tx, receiver) = mpsc::channel(buffer_size.max(1));

    let handle = tokio::spawn(async move {
        let mut assembler = ChunkAssembler::new(report_id, flush_threshold);
        let mut full_text = String::new();
        let mut cancelled = false;
        let mut error = None;
        let mut consumer_gone = false;
        let mut chunks_sent = 0usize;

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                item = upstream.recv() => item,
            };

            let piece = match item {
                None => break,
                Some(Ok(resp)) => resp.text_output().unwrap_or_default(),
                Some(Err(e)) => {
                    warn!(report_id = %report_id, error = %e, "Upstream stream failed");
                    error = Some(e);
                    break;
                }
            };
            full_text.push_str(&piece);

            let Some(chunk) = assembler.push(&piece) else {
                continue;
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                sent = tx.send(chunk) => {
                    if sent.is_err() {
                        consumer_gone = true;
                        break;
                    }
                    chunks_sent += 1;
                }
            }
        }
        // 尽早释放上游，后端据此停止生成
        drop(upstream);

        let last = assembler.finish();
        if consumer_gone {
            debug!(report_id = %report_id, "Stream consumer dropped");
        } else if cancelled {
            // 取消后调用方未必还在读取，不等待缓冲区腾出空间
            if tx.try_send(last).is_ok() {
                chunks_sent += 1;
            } else {
                debug!(report_id = %report_id, "Completion chunk dropped after cancellation");
            }
        } else if tx.send(last).await.is_ok() {
            chunks_sent += 1;
        }

        let outcome = StreamOutcome {
            report_id,
            full_text,
            chunks_sent,
            cancelled,
            error,
        };
        info!(
            report_id = %report_id,
            chunks = outcome.chunks_sent,
            cancelled = outcome.cancelled,
            failed = outcome.error.is_some(),
            "Report stream finished"
        );
        if let Some(hook) = on_complete {
            hook(&outcome);
        }
        outcome
    });

    ReportStream {
        report_id,
        receiver,
        handle,
    }
}
