//! Reports: session lifecycle, aggregates, filtered message storage, timed
//! steps and source-level symbolication.

use crate::device::Device;
use aegis_export::schema::{DecodedMessage, MessageType};
use aegis_export::sguid::SourceMapping;
use aegis_export::stream::DrainStats;
use aegis_export::scheduler::Scheduler;
use aegis_export::MessageStore;
use aegis_features::FeatureBits;
use fxhash::FxHashMap;
use std::fmt::Write as _;
use std::sync::Mutex;

/// Report activation parameters.
#[derive(Copy, Clone, Debug)]
pub struct ReportBeginInfo {
    pub features: FeatureBits,
    pub wait_for_compilation: bool,
}

/// One `step_interval` window of per-type error counts.
#[derive(Clone, Debug, Default)]
pub struct ReportStep {
    pub counts: FxHashMap<u32, u64>,
    pub seconds: f64,
}

impl ReportStep {
    /// Messages per second for one type within this window.
    pub fn rate(&self, message_type: MessageType) -> f64 {
        if self.seconds <= 0.0 {
            return 0.0;
        }
        *self.counts.get(&(message_type as u32)).unwrap_or(&0) as f64 / self.seconds
    }
}

/// Externally visible report state.
#[derive(Clone, Debug, PartialEq)]
pub enum ReportStatus {
    Idle,
    PendingShaderCompilation { remaining: u64 },
    PendingPipelineCompilation { remaining: u64 },
    Recording {
        elapsed_seconds: f64,
        filtered_messages: usize,
        latent_overshoots: u64,
        latent_undershoots: u64,
        exported_bytes: u64,
    },
}

/// One report session.
pub struct Report {
    pub begin_info: ReportBeginInfo,
    pub shader_commit: u64,
    pub pipeline_commit: u64,
    time_begin_ns: u64,
    step_begin_ns: u64,
    pub accumulated_elapsed_ns: u64,
    pub steps: Vec<ReportStep>,
    current_step: ReportStep,
    pub filtered_messages: MessageStore,
    pub stats: DrainStats,
    pub step_interval: f64,
    /// Bitmask over `MessageType` discriminants; cleared bits are filtered
    /// out.
    pub type_filter_mask: u32,
    recording: bool,
}

impl Report {
    fn new(step_interval: f64) -> Report {
        Report {
            begin_info: ReportBeginInfo {
                features: FeatureBits::empty(),
                wait_for_compilation: false,
            },
            shader_commit: 0,
            pipeline_commit: 0,
            time_begin_ns: 0,
            step_begin_ns: 0,
            accumulated_elapsed_ns: 0,
            steps: Vec::new(),
            current_step: ReportStep::default(),
            filtered_messages: MessageStore::new(),
            stats: DrainStats::default(),
            step_interval,
            type_filter_mask: !0,
            recording: false,
        }
    }

    pub fn elapsed_seconds(&self) -> f64 {
        let mut total = self.accumulated_elapsed_ns;
        if self.recording {
            total += time::precise_time_ns().saturating_sub(self.time_begin_ns);
        }
        total as f64 / 1e9
    }

    /// Record one filtered message into the store and the running step.
    fn insert(&mut self, export_id: u32, message: DecodedMessage) {
        let type_bit = 1u32 << (message.message_type() as u32);
        if self.type_filter_mask & type_bit == 0 {
            return;
        }
        *self
            .current_step
            .counts
            .entry(message.message_type() as u32)
            .or_insert(0) += 1;
        self.filtered_messages.add(export_id, message);
    }

    /// Close the current step window if its interval elapsed.
    fn roll_step(&mut self) {
        let now = time::precise_time_ns();
        let elapsed = (now.saturating_sub(self.step_begin_ns)) as f64 / 1e9;
        if elapsed >= self.step_interval {
            let mut step = std::mem::replace(&mut self.current_step, ReportStep::default());
            step.seconds = elapsed;
            self.steps.push(step);
            self.step_begin_ns = now;
        }
    }
}

struct RegistryState {
    reports: Vec<Report>,
    active: Option<usize>,
}

/// Owner of all report sessions and the active report pointer.
pub struct ReportRegistry {
    // Gates the active pointer and every aggregate mutation.
    lock: Mutex<RegistryState>,
}

/// Opaque report handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReportHandle(pub usize);

impl ReportRegistry {
    pub fn new() -> ReportRegistry {
        ReportRegistry {
            lock: Mutex::new(RegistryState { reports: Vec::new(), active: None }),
        }
    }

    pub fn create(&self, step_interval: f64) -> ReportHandle {
        let mut state = self.lock.lock().unwrap();
        state.reports.push(Report::new(step_interval));
        ReportHandle(state.reports.len() - 1)
    }

    /// Activate a report: set its features live, snapshot the compile
    /// commits, optionally block for compilation.
    pub fn begin(&self, device: &Device, handle: ReportHandle, info: ReportBeginInfo) {
        device.set_active_features(info.features);

        let shader_commit = device.compiler.commit_index();

        {
            let mut state = self.lock.lock().unwrap();
            let report = &mut state.reports[handle.0];
            report.begin_info = info;
            report.shader_commit = shader_commit;
            report.pipeline_commit = shader_commit;
            report.time_begin_ns = time::precise_time_ns();
            report.step_begin_ns = report.time_begin_ns;
            report.recording = true;
            state.active = Some(handle.0);
        }

        if info.wait_for_compilation {
            device.compiler.wait_for_completion(shader_commit);
        }
    }

    /// Status of a report against the compiler's completion head.
    pub fn status(&self, device: &Device, handle: ReportHandle) -> ReportStatus {
        let state = self.lock.lock().unwrap();
        let report = match state.reports.get(handle.0) {
            Some(report) => report,
            None => return ReportStatus::Idle,
        };
        if !report.recording {
            return ReportStatus::Idle;
        }

        let complete = device.compiler.complete_counter();
        if complete < report.shader_commit {
            return ReportStatus::PendingShaderCompilation {
                remaining: report.shader_commit - complete,
            };
        }
        if complete < report.pipeline_commit {
            return ReportStatus::PendingPipelineCompilation {
                remaining: report.pipeline_commit - complete,
            };
        }

        ReportStatus::Recording {
            elapsed_seconds: report.elapsed_seconds(),
            filtered_messages: report.filtered_messages.len(),
            latent_overshoots: report.stats.latent_overshoots,
            latent_undershoots: report.stats.latent_undershoots,
            exported_bytes: report.stats.exported_bytes,
        }
    }

    /// Drain pending exports into the active report.
    pub fn flush(&self, device: &Device, handle: ReportHandle) {
        let stats = device.pump();
        let mut storage = MessageStore::new();
        for feature in device.features() {
            feature.collect_messages(&mut storage);
        }

        let mut state = self.lock.lock().unwrap();
        let report = &mut state.reports[handle.0];
        report.stats.accumulate(stats);
        for stored in storage.iter() {
            for _ in 0..stored.merged_count {
                report.insert(stored.export_id, stored.message);
            }
        }
        report.roll_step();
    }

    /// End the report: final flush, close the step, deactivate features.
    /// Reports always succeed to end; they may end empty with overshoot
    /// counters set.
    pub fn end(&self, device: &Device, handle: ReportHandle) {
        device.scheduler.wait_for_pending();
        self.flush(device, handle);

        let mut state = self.lock.lock().unwrap();
        {
            let report = &mut state.reports[handle.0];
            if report.recording {
                report.accumulated_elapsed_ns +=
                    time::precise_time_ns().saturating_sub(report.time_begin_ns);
                report.recording = false;
            }
            let mut step = std::mem::replace(&mut report.current_step, ReportStep::default());
            if !step.counts.is_empty() {
                step.seconds = report.step_interval.max(1e-9);
                report.steps.push(step);
            }
        }
        state.active = None;
        drop(state);

        device.set_active_features(FeatureBits::empty());
    }

    /// Read-only access to a report.
    pub fn with_report<R>(&self, handle: ReportHandle, f: impl FnOnce(&Report) -> R) -> Option<R> {
        let state = self.lock.lock().unwrap();
        state.reports.get(handle.0).map(f)
    }
}

// ---------------------------------------------------------------------------
// IR provider

/// The external collaborator that owns the binary shader format. The
/// reference implementation wraps the word-stream codec; real backends plug
/// their own parser in.
pub trait IrProvider: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> aegis_ir::Result<aegis_ir::program::Program>;

    fn stitch(&self, program: &aegis_ir::program::Program) -> Vec<u8>;

    /// Debug information of a parsed module, when the binary carried any.
    fn debug(&self, program: &aegis_ir::program::Program) -> Option<SourceMap>;
}

/// Codec-backed provider. Source locations survive the round trip as
/// location directives; full source text only exists when a sidecar map was
/// registered, so `debug` is `None` here.
pub struct ReferenceIrProvider;

impl IrProvider for ReferenceIrProvider {
    fn parse(&self, bytes: &[u8]) -> aegis_ir::Result<aegis_ir::program::Program> {
        aegis_ir::codec::parse_bytes(bytes)
    }

    fn stitch(&self, program: &aegis_ir::program::Program) -> Vec<u8> {
        aegis_ir::codec::stitch_bytes(program)
    }

    fn debug(&self, _program: &aegis_ir::program::Program) -> Option<SourceMap> {
        None
    }
}

// ---------------------------------------------------------------------------
// Symbolication

/// One reconstructed source fragment of a file.
#[derive(Clone, Debug)]
pub struct SourceFragment {
    pub file_uid: u32,
    /// First line this fragment covers, 1-based.
    pub line_offset: u32,
    pub text: String,
}

/// Line-aligned reconstructed source across include fragments, as produced
/// by the IR provider's debug interface.
#[derive(Clone, Debug, Default)]
pub struct SourceMap {
    fragments: Vec<SourceFragment>,
}

impl SourceMap {
    pub fn new() -> SourceMap {
        Default::default()
    }

    pub fn add_fragment(&mut self, fragment: SourceFragment) {
        self.fragments.push(fragment);
    }

    /// Produce the combined, line-aligned source text of one file: every
    /// fragment lands at its original line number, gaps stay empty.
    pub fn fill_combined_source(&self, file_uid: u32, out: &mut String) {
        let mut lines: Vec<&str> = Vec::new();
        for fragment in self.fragments.iter().filter(|f| f.file_uid == file_uid) {
            let mut line = fragment.line_offset.saturating_sub(1) as usize;
            for text in fragment.text.lines() {
                if lines.len() <= line {
                    lines.resize(line + 1, "");
                }
                lines[line] = text;
                line += 1;
            }
        }
        for line in lines {
            out.push_str(line);
            out.push('\n');
        }
    }
}

/// A message joined with its resolved source mapping.
pub struct SymbolicatedMessage {
    pub message: DecodedMessage,
    pub merged_count: u64,
    pub mapping: Option<SourceMapping>,
}

/// Resolve every stored message of a report against the SGUID host.
pub fn symbolicate(device: &Device, report: &Report) -> Vec<SymbolicatedMessage> {
    report
        .filtered_messages
        .iter()
        .map(|stored| SymbolicatedMessage {
            message: stored.message,
            merged_count: stored.merged_count,
            mapping: device.sguid.mapping_of(stored.message.sguid()),
        })
        .collect()
}

fn type_name(message_type: MessageType) -> &'static str {
    match message_type {
        MessageType::DescriptorMismatch => "descriptor-mismatch",
        MessageType::ResourceIndexOutOfBounds => "resource-index-out-of-bounds",
        MessageType::ResourceRaceCondition => "resource-race-condition",
        MessageType::TexelInitialization => "texel-initialization",
        MessageType::ExportUnstable => "export-unstable",
        MessageType::DivergentResourceIndexing => "divergent-resource-indexing",
        MessageType::WaterfallingCondition => "waterfalling-condition",
    }
}

/// Printable per-message listing.
pub fn print_report(device: &Device, report: &Report) -> String {
    let mut out = String::new();
    for entry in symbolicate(device, report) {
        let location = match entry.mapping {
            Some(mapping) => format!("{}:{}:{}", mapping.file_uid, mapping.line, mapping.column),
            None => "<unknown>".to_string(),
        };
        let _ = writeln!(
            out,
            "{} x{} at {} {:?}",
            type_name(entry.message.message_type()),
            entry.merged_count,
            location,
            entry.message.coordinate(),
        );
    }
    out
}

/// Printable aggregate summary with per-step rates.
pub fn print_summary(report: &Report) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} unique messages, {} total, {:.2}s",
        report.filtered_messages.len(),
        report.filtered_messages.total_count(),
        report.elapsed_seconds()
    );
    let _ = writeln!(
        out,
        "overshoots: {}, undershoots: {}, exported: {} bytes",
        report.stats.latent_overshoots,
        report.stats.latent_undershoots,
        report.stats.exported_bytes
    );
    for (index, step) in report.steps.iter().enumerate() {
        let total: u64 = step.counts.values().sum();
        let _ = writeln!(out, "step {}: {} messages over {:.2}s", index, total, step.seconds);
    }
    out
}

/// Export format of `export_report`. Re-exporting the same format
/// overwrites; the operation is idempotent.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExportFormat {
    Csv,
    Html,
}

pub fn export_report(device: &Device, report: &Report, format: ExportFormat) -> String {
    let entries = symbolicate(device, report);
    match format {
        ExportFormat::Csv => {
            let mut out = String::from("type,count,file,line,column,x,y,z\n");
            for entry in entries {
                let (file, line, column) = entry
                    .mapping
                    .map(|m| (m.file_uid, m.line, m.column))
                    .unwrap_or((0, 0, 0));
                let coordinate = entry.message.coordinate();
                let _ = writeln!(
                    out,
                    "{},{},{},{},{},{},{},{}",
                    type_name(entry.message.message_type()),
                    entry.merged_count,
                    file,
                    line,
                    column,
                    coordinate[0],
                    coordinate[1],
                    coordinate[2],
                );
            }
            out
        }
        ExportFormat::Html => {
            let mut out = String::from("<table><tr><th>type</th><th>count</th><th>location</th></tr>\n");
            for entry in entries {
                let location = entry
                    .mapping
                    .map(|m| format!("{}:{}:{}", m.file_uid, m.line, m.column))
                    .unwrap_or_else(|| "?".to_string());
                let _ = writeln!(
                    out,
                    "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
                    type_name(entry.message.message_type()),
                    entry.merged_count,
                    location,
                );
            }
            out.push_str("</table>\n");
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_source_is_line_aligned() {
        let mut map = SourceMap::new();
        map.add_fragment(SourceFragment {
            file_uid: 1,
            line_offset: 1,
            text: "void main() {".to_string(),
        });
        map.add_fragment(SourceFragment {
            file_uid: 1,
            line_offset: 4,
            text: "}".to_string(),
        });
        map.add_fragment(SourceFragment {
            file_uid: 2,
            line_offset: 1,
            text: "other file".to_string(),
        });

        let mut out = String::new();
        map.fill_combined_source(1, &mut out);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines, vec!["void main() {", "", "", "}"]);
    }

    #[test]
    fn step_rates_derive_from_counts() {
        let mut step = ReportStep::default();
        step.counts.insert(MessageType::ResourceIndexOutOfBounds as u32, 10);
        step.seconds = 2.0;
        assert!((step.rate(MessageType::ResourceIndexOutOfBounds) - 5.0).abs() < 1e-9);
        assert_eq!(step.rate(MessageType::ExportUnstable), 0.0);
    }
}
