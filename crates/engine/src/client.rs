//! Upload side of a pipeline.
//!
//! A client is a stage of its own in the topology (no upstream, the entry
//! stages as downstream). It publishes a stream in chunks and then signals
//! done to every replica of every entry stage.

use tracing::info;

use crate::envelope::ShardKey;
use crate::routing::StageOutput;
use crate::{CorrelationId, Error, Result};

/// Publishes whole streams into the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineClient {
    output: StageOutput,
}

impl PipelineClient {
    /// Wrap the output of the client stage.
    #[must_use]
    pub const fn new(output: StageOutput) -> Self {
        Self { output }
    }

    /// Underlying output.
    #[must_use]
    pub const fn output(&self) -> &StageOutput {
        &self.output
    }

    /// Publish every chunk of a stream to each downstream stage, then send
    /// done-markers after them. Returns the number of chunks published per
    /// stage.
    ///
    /// # Errors
    ///
    /// Any routing or publish failure.
    pub async fn upload<I>(&self, correlation_id: &CorrelationId, chunks: I) -> Result<usize>
    where
        I: IntoIterator<Item = Vec<u8>>,
        I::IntoIter: Send,
    {
        let downstream = self.output.downstream()?.to_vec();
        let mut sent: usize = 0;
        for chunk in chunks {
            for stage in &downstream {
                self.output
                    .send(chunk.clone(), stage, correlation_id, ShardKey::ContentHash)
                    .await?;
            }
            sent = sent.saturating_add(1);
        }
        let markers = self.finish(correlation_id).await?;
        info!(
            client = %self.output.sender(),
            correlation_id = %correlation_id,
            chunks = sent,
            markers,
            "Stream uploaded"
        );
        Ok(sent)
    }

    /// Close a stream at every entry stage.
    ///
    /// # Errors
    ///
    /// Any publish failure.
    pub async fn finish(&self, correlation_id: &CorrelationId) -> Result<usize> {
        self.output.send_done_all(correlation_id).await
    }
}

/// Split CSV text into chunks of at most `lines` data rows, each starting
/// with the header row.
///
/// # Errors
///
/// Returns `InvalidRecord` if `lines` is zero or the input has no header.
pub fn csv_chunks(csv: &str, lines: usize) -> Result<Vec<Vec<u8>>> {
    if lines == 0 {
        return Err(Error::invalid_record("chunk size must be at least one line"));
    }
    let mut rows = csv.lines().map(|l| l.trim_end_matches('\r')).filter(|l| !l.is_empty());
    let header = rows
        .next()
        .ok_or_else(|| Error::invalid_record("CSV input has no header"))?;
    let rows: Vec<&str> = rows.collect();

    Ok(rows
        .chunks(lines)
        .map(|chunk| {
            let mut body = String::with_capacity(header.len().saturating_add(1));
            body.push_str(header);
            body.push('\n');
            for row in chunk {
                body.push_str(row);
                body.push('\n');
            }
            body.into_bytes()
        })
        .collect())
}
