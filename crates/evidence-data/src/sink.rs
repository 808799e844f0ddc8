//! Append-only record sinks.
//!
//! A run writes newline-delimited JSON records into named streams, one
//! stream per fact type. [`JsonlShardSink`] splits every stream into
//! size-bounded shard files; [`crate::store::SqliteSink`] keeps everything in
//! one database; [`MemorySink`] keeps records in process for tests.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use eyre::{bail, eyre, Context, Result};
use serde::Serialize;

/// Static description of one output stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: &'static str,
    /// What one record in the stream represents.
    pub description: &'static str,
    /// How to read an empty stream.
    pub when_empty: EmptyMeaning,
}

/// Why a stream may legitimately contain zero records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyMeaning {
    /// Nothing of this kind happened in the transaction set.
    ExpectedEmpty(&'static str),
    /// The execution backend cannot provide this data.
    KnownLimitation(&'static str),
}

impl EmptyMeaning {
    pub(crate) fn render(self) -> String {
        match self {
            Self::ExpectedEmpty(why) => format!("expected-empty: {why}"),
            Self::KnownLimitation(why) => format!("known-limitation-empty: {why}"),
        }
    }
}

/// Final per-stream counts reported by [`RecordSink::finish`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    pub name: String,
    pub records: u64,
    pub shards: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SinkSummary {
    pub backend: &'static str,
    pub streams: Vec<StreamSummary>,
}

impl SinkSummary {
    pub fn records(&self, stream: &str) -> u64 {
        self.streams
            .iter()
            .find(|s| s.name == stream)
            .map_or(0, |s| s.records)
    }
}

/// Durable, append-only writer for JSON records grouped into streams.
///
/// `append` only buffers; it never waits for earlier writes to reach disk.
/// `finish` flushes everything durably and must be called exactly once.
pub trait RecordSink {
    /// Creates the stream even if nothing is ever appended to it.
    ///
    /// # Errors
    /// Returns error if backing storage for the stream cannot be created.
    fn open_stream(&mut self, spec: &StreamSpec) -> Result<()>;

    /// Appends one serialized JSON record (without trailing newline).
    ///
    /// # Errors
    /// Returns error if the stream was never opened or the write fails.
    fn append(&mut self, stream: &str, json: &str) -> Result<()>;

    /// Flushes and closes every stream.
    ///
    /// # Errors
    /// Returns error if a flush, sync or manifest write fails.
    fn finish(&mut self) -> Result<SinkSummary>;

    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;
}

impl<T: RecordSink + ?Sized> RecordSink for Box<T> {
    fn open_stream(&mut self, spec: &StreamSpec) -> Result<()> {
        (**self).open_stream(spec)
    }

    fn append(&mut self, stream: &str, json: &str) -> Result<()> {
        (**self).append(stream, json)
    }

    fn finish(&mut self) -> Result<SinkSummary> {
        (**self).finish()
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}

struct OpenShard {
    writer: BufWriter<File>,
    records: usize,
}

impl OpenShard {
    fn close(mut self) -> Result<()> {
        self.writer.flush().wrap_err("failed to flush shard")?;
        self.writer
            .get_ref()
            .sync_all()
            .wrap_err("failed to sync shard")?;
        Ok(())
    }
}

struct ShardedStream {
    spec: StreamSpec,
    dir: PathBuf,
    records: u64,
    shards: Vec<String>,
    current: Option<OpenShard>,
}

impl ShardedStream {
    fn append(&mut self, json: &str, capacity: usize) -> Result<()> {
        let full = self
            .current
            .as_ref()
            .map_or(true, |shard| shard.records >= capacity);
        if full {
            if let Some(shard) = self.current.take() {
                shard.close()?;
            }
            let name = format!("{}-{:05}.jsonl", self.spec.name, self.shards.len());
            let path = self.dir.join(&name);
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .wrap_err_with(|| format!("failed to create shard {}", path.display()))?;
            tracing::debug!(stream = self.spec.name, shard = %name, "opened shard");
            self.shards.push(name);
            self.current = Some(OpenShard {
                writer: BufWriter::new(file),
                records: 0,
            });
        }

        let shard = self
            .current
            .as_mut()
            .ok_or_else(|| eyre!("no open shard for stream {}", self.spec.name))?;
        shard.writer.write_all(json.as_bytes())?;
        shard.writer.write_all(b"\n")?;
        shard.records += 1;
        self.records += 1;
        Ok(())
    }

    fn summary(&self) -> StreamSummary {
        StreamSummary {
            name: self.spec.name.to_string(),
            records: self.records,
            shards: self.shards.clone(),
        }
    }
}

#[derive(Serialize)]
struct Manifest<'a> {
    run_id: &'a str,
    generated_at: String,
    shard_capacity: usize,
    streams: Vec<ManifestStream<'a>>,
}

#[derive(Serialize)]
struct ManifestStream<'a> {
    name: &'a str,
    description: &'a str,
    records: u64,
    shards: &'a [String],
    when_empty: String,
}

/// Sharded JSONL sink rooted at one run directory.
///
/// Layout: `<root>/<stream>/<stream>-00000.jsonl`, plus `manifest.json` and
/// `STREAMS.md` written by `finish`.
pub struct JsonlShardSink {
    root: PathBuf,
    run_id: String,
    shard_capacity: usize,
    streams: Vec<ShardedStream>,
    finished: bool,
}

impl JsonlShardSink {
    /// Creates the run directory.
    ///
    /// # Errors
    /// Returns error if `shard_capacity` is zero or the directory cannot be
    /// created.
    pub fn new(root: &Path, run_id: &str, shard_capacity: usize) -> Result<Self> {
        if shard_capacity == 0 {
            bail!("shard capacity must be at least 1");
        }
        std::fs::create_dir_all(root)
            .wrap_err_with(|| format!("failed to create output directory {}", root.display()))?;
        tracing::info!(root = %root.display(), shard_capacity, "writing JSONL shards");
        Ok(Self {
            root: root.to_path_buf(),
            run_id: run_id.to_string(),
            shard_capacity,
            streams: Vec::new(),
            finished: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn write_manifest(&self) -> Result<()> {
        let manifest = Manifest {
            run_id: &self.run_id,
            generated_at: chrono::Utc::now().to_rfc3339(),
            shard_capacity: self.shard_capacity,
            streams: self
                .streams
                .iter()
                .map(|s| ManifestStream {
                    name: s.spec.name,
                    description: s.spec.description,
                    records: s.records,
                    shards: &s.shards,
                    when_empty: s.spec.when_empty.render(),
                })
                .collect(),
        };
        let path = self.root.join("manifest.json");
        let body = serde_json::to_string_pretty(&manifest)?;
        std::fs::write(&path, body)
            .wrap_err_with(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    fn write_stream_notes(&self) -> Result<()> {
        let mut doc = format!(
            "# Output streams for run `{}`\n\n\
             Every stream is present even when it holds no records. An empty stream is\n\
             either expected-empty (nothing of that kind happened in this transaction set)\n\
             or known-limitation-empty (the execution backend cannot supply the data).\n\n\
             | stream | records | description | if empty |\n\
             |--------|---------|-------------|----------|\n",
            self.run_id
        );
        for s in &self.streams {
            doc.push_str(&format!(
                "| `{}` | {} | {} | {} |\n",
                s.spec.name,
                s.records,
                s.spec.description,
                s.spec.when_empty.render()
            ));
        }
        doc.push_str(
            "\n`state_diff` records are captured in prestate-only mode: `balance_after` and\n\
             `storage_after` are always null because the tracer cannot report post-call\n\
             values. Null there does not mean \"unchanged\".\n",
        );

        let path = self.root.join("STREAMS.md");
        std::fs::write(&path, doc).wrap_err_with(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

impl RecordSink for JsonlShardSink {
    fn open_stream(&mut self, spec: &StreamSpec) -> Result<()> {
        if self.streams.iter().any(|s| s.spec.name == spec.name) {
            return Ok(());
        }
        let dir = self.root.join(spec.name);
        std::fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("failed to create stream directory {}", dir.display()))?;
        self.streams.push(ShardedStream {
            spec: *spec,
            dir,
            records: 0,
            shards: Vec::new(),
            current: None,
        });
        Ok(())
    }

    fn append(&mut self, stream: &str, json: &str) -> Result<()> {
        let capacity = self.shard_capacity;
        let target = self
            .streams
            .iter_mut()
            .find(|s| s.spec.name == stream)
            .ok_or_else(|| eyre!("stream {stream} was not opened"))?;
        target
            .append(json, capacity)
            .wrap_err_with(|| format!("failed to append to stream {stream}"))
    }

    fn finish(&mut self) -> Result<SinkSummary> {
        if self.finished {
            bail!("sink already finished");
        }
        for stream in &mut self.streams {
            if let Some(shard) = stream.current.take() {
                shard
                    .close()
                    .wrap_err_with(|| format!("failed to close stream {}", stream.spec.name))?;
            }
        }
        self.write_manifest()?;
        self.write_stream_notes()?;
        self.finished = true;

        Ok(SinkSummary {
            backend: self.backend_type(),
            streams: self.streams.iter().map(ShardedStream::summary).collect(),
        })
    }

    fn backend_type(&self) -> &'static str {
        "JSONL"
    }
}

impl Drop for JsonlShardSink {
    fn drop(&mut self) {
        for stream in &mut self.streams {
            if let Some(mut shard) = stream.current.take() {
                let _ = shard.writer.flush();
            }
        }
    }
}

/// In-process sink; records stay available for inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    streams: Vec<StreamSpec>,
    lines: Vec<(String, String)>,
    finished: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn stream_names(&self) -> Vec<&'static str> {
        self.streams.iter().map(|spec| spec.name).collect()
    }

    /// Records of one stream, parsed back to JSON values, in write order.
    pub fn records(&self, stream: &str) -> Vec<serde_json::Value> {
        self.lines
            .iter()
            .filter(|(name, _)| name == stream)
            .filter_map(|(_, line)| serde_json::from_str(line).ok())
            .collect()
    }

    /// Every record in global write order as `(stream, json)`.
    pub fn lines(&self) -> &[(String, String)] {
        &self.lines
    }
}

impl RecordSink for MemorySink {
    fn open_stream(&mut self, spec: &StreamSpec) -> Result<()> {
        if !self.streams.iter().any(|s| s.name == spec.name) {
            self.streams.push(*spec);
        }
        Ok(())
    }

    fn append(&mut self, stream: &str, json: &str) -> Result<()> {
        if !self.streams.iter().any(|s| s.name == stream) {
            bail!("stream {stream} was not opened");
        }
        self.lines.push((stream.to_string(), json.to_string()));
        Ok(())
    }

    fn finish(&mut self) -> Result<SinkSummary> {
        if self.finished {
            bail!("sink already finished");
        }
        self.finished = true;
        let streams = self
            .streams
            .iter()
            .map(|spec| StreamSummary {
                name: spec.name.to_string(),
                records: self.lines.iter().filter(|(s, _)| s == spec.name).count() as u64,
                shards: Vec::new(),
            })
            .collect();
        Ok(SinkSummary {
            backend: self.backend_type(),
            streams,
        })
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
