//! Host boundary
//!
//! The query host drives the plugin over JSON lines: one request per line in,
//! row lines followed by exactly one status line out. A `{"describe": true}`
//! request answers with the plugin descriptor instead.

use crate::engine::{Diagnostic, HydrationEngine, QueryRequest, QueryStatus, Row};
use crate::error::ErrorKind;
use crate::resource::{SchemaRegistry, TableInfo};
use crate::scope::ResourceScope;
use serde::Serialize;
use serde_json::Value;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const PLUGIN_NAME: &str = "gcptables";

/// Rows buffered between a running query and the writer
const ROW_CHANNEL_CAPACITY: usize = 256;

/// What the plugin offers the host
#[derive(Debug, Clone, Serialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    pub tables: Vec<TableInfo>,
}

impl PluginDescriptor {
    pub fn new(registry: &SchemaRegistry) -> Self {
        Self {
            name: PLUGIN_NAME.to_string(),
            version: crate::VERSION.to_string(),
            tables: registry.tables(),
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Line<'a> {
    Descriptor {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<&'a Value>,
        #[serde(flatten)]
        plugin: &'a PluginDescriptor,
    },
    Row {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<&'a Value>,
        scope: &'a ResourceScope,
        row: Value,
        #[serde(skip_serializing_if = "no_diagnostics")]
        diagnostics: &'a [Diagnostic],
    },
    Status {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<&'a Value>,
        status: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        table: Option<&'a str>,
        rows: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<ErrorKind>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "no_diagnostics")]
        warnings: &'a [Diagnostic],
    },
}

fn no_diagnostics(d: &&[Diagnostic]) -> bool {
    d.is_empty()
}

impl<'a> Line<'a> {
    fn row(id: Option<&'a Value>, row: &'a Row) -> Self {
        Line::Row {
            id,
            scope: &row.scope,
            row: row.to_json(),
            diagnostics: &row.diagnostics,
        }
    }

    fn status(id: Option<&'a Value>, status: &'a QueryStatus) -> Self {
        match status {
            QueryStatus::Done {
                table,
                rows,
                warnings,
            } => Line::Status {
                id,
                status: "done",
                table: Some(table),
                rows: *rows,
                kind: None,
                message: None,
                warnings,
            },
            QueryStatus::Failed {
                table,
                error,
                rows,
                warnings,
            } => Line::Status {
                id,
                status: "failed",
                table: Some(table),
                rows: *rows,
                kind: Some(error.kind()),
                message: Some(error.to_string()),
                warnings,
            },
        }
    }

    fn bad_request(id: Option<&'a Value>, message: String) -> Self {
        Line::Status {
            id,
            status: "failed",
            table: None,
            rows: 0,
            kind: Some(ErrorKind::BadRequest),
            message: Some(message),
            warnings: &[],
        }
    }
}

async fn write_line<W>(writer: &mut W, line: &Line<'_>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = serde_json::to_vec(line).map_err(io::Error::other)?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Serve requests from `reader` until EOF or cancellation.
///
/// Queries run one at a time, in request order.
pub async fn serve<R, W>(
    engine: &HydrationEngine,
    reader: R,
    mut writer: W,
    cancel: CancellationToken,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let descriptor = PluginDescriptor::new(engine.registry());
    let mut lines = reader.lines();

    tracing::info!("Serving {} tables", descriptor.tables.len());

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            tracing::info!("Host closed input");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Malformed request line: {}", e);
                write_line(&mut writer, &Line::bad_request(None, e.to_string())).await?;
                continue;
            }
        };
        let id = value.get("id").cloned();

        if value.get("describe").and_then(|v| v.as_bool()) == Some(true) {
            let line = Line::Descriptor {
                id: id.as_ref(),
                plugin: &descriptor,
            };
            write_line(&mut writer, &line).await?;
            continue;
        }

        let request: QueryRequest = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Invalid query request: {}", e);
                write_line(&mut writer, &Line::bad_request(id.as_ref(), e.to_string())).await?;
                continue;
            }
        };

        run_query(engine, request, id.as_ref(), &mut writer, cancel.child_token()).await?;
    }

    Ok(())
}

/// Run one query, streaming its rows and then its status line
async fn run_query<W>(
    engine: &HydrationEngine,
    request: QueryRequest,
    id: Option<&Value>,
    writer: &mut W,
    cancel: CancellationToken,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::channel::<Row>(ROW_CHANNEL_CAPACITY);
    let out = &mut *writer;

    // Returning early drops the receiver, which stops the query.
    let forward = async move {
        while let Some(row) = rx.recv().await {
            write_line(out, &Line::row(id, &row)).await?;
        }
        Ok::<_, io::Error>(())
    };

    let (status, forwarded) = tokio::join!(engine.execute(request, cancel, tx), forward);
    forwarded?;

    write_line(writer, &Line::status(id, &status)).await
}
