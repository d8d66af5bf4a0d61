//! Chunked LIST upload with verification.
//!
//! The card accepts at most ~1000 points per LIST and at most ~253 bytes
//! per command, at ~25 ms per command. Uploading a waveform therefore
//! means many small paced commands, followed by an explicit check that the
//! card actually ingested everything: its own protocol errors are silent
//! on the wire and only discoverable through `SYST:ERR?`.
//!
//! The sequence follows the manual's Figure B-2 order. Synchronization
//! uses `*WAI` rather than `*OPC?` on purpose: `*WAI` blocks the card's
//! command processor without producing a response, so there is nothing to
//! time out on.

use crate::client::KepcoClient;
use crate::error::Error;
use crate::scpi::Quantity;

/// Most points one upload may carry; callers split larger waveforms.
pub const MAX_CHUNK_POINTS: usize = 1000;

/// Safe command length under the card's 253-byte input buffer.
pub const CHUNK_CMD_LIMIT: usize = 200;

/// Most values per `LIST:{mode}` command; the manual's examples max at 11.
pub const LIST_VALUES_PER_CMD: usize = 10;

/// Upload failures. Transport problems and verification problems are
/// separate variants so callers can decide whether a retry makes sense.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("empty point list")]
    EmptyChunk,

    #[error("chunk exceeds {MAX_CHUNK_POINTS} points: {0}")]
    ChunkTooLarge(usize),

    /// A command or query failed at the transport level.
    #[error("'{command}' failed: {source}")]
    Transport {
        command: String,
        #[source]
        source: Error,
    },

    /// The card reports a different point count than was sent.
    #[error("point count mismatch: sent {sent}, device reports {reported}")]
    CountMismatch { sent: usize, reported: usize },

    /// The card queued protocol errors during the upload.
    #[error("device errors: {}", .0.join("; "))]
    DeviceErrors(Vec<String>),
}

type ProgressFn<'a> = Box<dyn FnMut(usize, usize) + Send + 'a>;

/// Drives the chunked upload / verify / run procedure over a client.
pub struct ListUploader<'a> {
    client: &'a KepcoClient,
    progress: Option<ProgressFn<'a>>,
}

impl<'a> ListUploader<'a> {
    pub fn new(client: &'a KepcoClient) -> Self {
        ListUploader {
            client,
            progress: None,
        }
    }

    /// Register a `(sent, total)` callback fired after every value batch.
    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: FnMut(usize, usize) + Send + 'a,
    {
        self.progress = Some(Box::new(f));
        self
    }

    /// Upload one chunk of at most [`MAX_CHUNK_POINTS`] points, then
    /// verify the card accepted all of them.
    pub fn upload_chunk(
        &mut self,
        points: &[f64],
        dwell: f64,
        mode: Quantity,
    ) -> Result<(), UploadError> {
        if points.is_empty() {
            return Err(UploadError::EmptyChunk);
        }
        if points.len() > MAX_CHUNK_POINTS {
            return Err(UploadError::ChunkTooLarge(points.len()));
        }

        // Setup, in the manual's order: mode, full-scale range (quarter
        // scale causes transients), clear, sync, dwell before values.
        let mnemonic = mode.mnemonic();
        let setup = [
            format!("FUNC:MODE {mnemonic}"),
            format!("{mnemonic}:RANG 1"),
            "LIST:CLE".to_string(),
            "*WAI".to_string(),
            format!("LIST:DWEL {dwell:.6}"),
        ];
        for cmd in &setup {
            self.command(cmd)?;
        }

        // Values, in batches bounded by count and command length.
        let prefix = format!("LIST:{mnemonic} ");
        let total = points.len();
        let mut sent = 0;
        for batch in value_batches(prefix.len(), points) {
            self.command(&format!("{prefix}{}", batch.join(",")))?;
            sent += batch.len();
            if let Some(progress) = self.progress.as_mut() {
                progress(sent, total);
            }
        }

        // Verify: sync, count check, then drain the silent error queue.
        self.command("*WAI")?;
        let count_query = format!("LIST:{mnemonic}:POIN?");
        let reported = self.query(&count_query)?;
        if let Ok(count) = reported.trim().parse::<usize>() {
            if count != total {
                return Err(UploadError::CountMismatch {
                    sent: total,
                    reported: count,
                });
            }
        }
        let errors = self
            .client
            .drain_errors()
            .map_err(|source| UploadError::Transport {
                command: "SYST:ERR?".to_string(),
                source,
            })?;
        if !errors.is_empty() {
            return Err(UploadError::DeviceErrors(errors));
        }

        log::debug!("uploaded {total} pts @ {:.3} ms/step (verified)", dwell * 1e3);
        Ok(())
    }

    /// Start LIST execution: count, output on, mode to LIST, in that order.
    pub fn run(&mut self, mode: Quantity, count: i64) -> Result<(), UploadError> {
        let commands = [
            format!("LIST:COUN {count}"),
            "OUTP ON".to_string(),
            format!("{}:MODE LIST", mode.mnemonic()),
        ];
        for cmd in &commands {
            self.command(cmd)?;
        }
        Ok(())
    }

    /// Return the supply to a safe fixed-output idle state.
    pub fn stop(&mut self) -> Result<(), UploadError> {
        for cmd in ["VOLT:MODE FIX", "CURR:MODE FIX", "OUTP OFF", "FUNC:MODE VOLT"] {
            self.command(cmd)?;
        }
        Ok(())
    }

    fn command(&mut self, cmd: &str) -> Result<(), UploadError> {
        self.client
            .send_cmd(cmd)
            .map_err(|source| UploadError::Transport {
                command: cmd.to_string(),
                source,
            })
    }

    fn query(&mut self, cmd: &str) -> Result<String, UploadError> {
        self.client
            .send_query(cmd)
            .map_err(|source| UploadError::Transport {
                command: cmd.to_string(),
                source,
            })
    }
}

/// Compact value rendering matching the manual's examples: at most four
/// decimals, trailing zeros and a bare trailing point stripped
/// (`3.0` → `"3"`, `2.50` → `"2.5"`).
pub(crate) fn format_point(value: f64) -> String {
    let s = format!("{value:.4}");
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    }
}

/// Split points into formatted batches, each at most
/// [`LIST_VALUES_PER_CMD`] values and at most [`CHUNK_CMD_LIMIT`] bytes
/// including the command prefix.
fn value_batches(prefix_len: usize, points: &[f64]) -> Vec<Vec<String>> {
    let mut batches = Vec::new();
    let mut batch: Vec<String> = Vec::new();
    let mut joined_len = 0;
    for point in points {
        let value = format_point(*point);
        let trial_len = joined_len + value.len() + if batch.is_empty() { 0 } else { 1 };
        if !batch.is_empty()
            && (prefix_len + trial_len > CHUNK_CMD_LIMIT || batch.len() + 1 > LIST_VALUES_PER_CMD)
        {
            joined_len = 0;
            batches.push(std::mem::take(&mut batch));
        }
        joined_len += value.len() + if batch.is_empty() { 0 } else { 1 };
        batch.push(value);
    }
    if !batch.is_empty() {
        batches.push(batch);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_format_is_compact() {
        assert_eq!(format_point(3.0), "3");
        assert_eq!(format_point(2.5), "2.5");
        assert_eq!(format_point(-1.20), "-1.2");
        assert_eq!(format_point(0.0), "0");
        assert_eq!(format_point(1.23456), "1.2346");
        assert_eq!(format_point(-0.00001), "-0");
    }

    #[test]
    fn batches_respect_count_and_length_limits() {
        let prefix = "LIST:VOLT ";
        let points: Vec<f64> = (0..137).map(|i| i as f64 * 0.137).collect();
        let batches = value_batches(prefix.len(), &points);

        let mut flattened = Vec::new();
        for batch in &batches {
            assert!(!batch.is_empty());
            assert!(batch.len() <= LIST_VALUES_PER_CMD, "batch of {}", batch.len());
            let cmd_len = prefix.len() + batch.join(",").len();
            assert!(cmd_len <= CHUNK_CMD_LIMIT, "command of {cmd_len} bytes");
            flattened.extend(batch.iter().cloned());
        }
        // Every point exactly once, in order.
        let expected: Vec<String> = points.iter().map(|&p| format_point(p)).collect();
        assert_eq!(flattened, expected);
    }

    #[test]
    fn long_values_force_small_batches() {
        // Each value renders to 20 chars, so the length cap bites before
        // the per-command value count does.
        let points = vec![-1234567890123456.75; 30];
        assert_eq!(format_point(points[0]).len(), 20);
        let batches = value_batches("LIST:VOLT ".len(), &points);
        for batch in &batches {
            assert!(batch.len() < LIST_VALUES_PER_CMD);
            assert!("LIST:VOLT ".len() + batch.join(",").len() <= CHUNK_CMD_LIMIT);
        }
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 30);
    }

    #[test]
    fn single_batch_for_few_points() {
        let batches = value_batches("LIST:VOLT ".len(), &[1.0, 2.0, 3.0]);
        assert_eq!(batches, vec![vec!["1", "2", "3"]]);
    }
}
