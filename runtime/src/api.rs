//! The stable host API over the device registry.

use crate::device::Device;
use crate::report::{
    export_report, print_report, print_summary, ExportFormat, Report, ReportBeginInfo,
    ReportHandle, ReportStatus,
};
use aegis_features::FeatureBits;

/// Allocate a report handle.
pub fn create_report(device: &Device) -> ReportHandle {
    device.reports.create(device.settings.step_interval_seconds)
}

/// Activate the features in `begin_info` and snapshot compile commits. May
/// block when `wait_for_compilation` is set.
pub fn begin_report(device: &Device, report: ReportHandle, begin_info: ReportBeginInfo) {
    device.reports.begin(device, report, begin_info);
}

pub fn get_report_status(device: &Device, report: ReportHandle) -> ReportStatus {
    device.reports.status(device, report)
}

/// Flush pending exports into the report without ending it.
pub fn flush_report(device: &Device, report: ReportHandle) {
    device.reports.flush(device, report);
}

/// Flush, close and deactivate. Always succeeds; the report may end empty
/// with overshoot counters set.
pub fn end_report(device: &Device, report: ReportHandle) {
    device.reports.end(device, report);
}

pub fn get_report_info<R>(device: &Device, report: ReportHandle, f: impl FnOnce(&Report) -> R) -> Option<R> {
    device.reports.with_report(report, f)
}

pub fn print_report_text(device: &Device, report: ReportHandle) -> String {
    device
        .reports
        .with_report(report, |r| print_report(device, r))
        .unwrap_or_default()
}

pub fn print_summary_text(device: &Device, report: ReportHandle) -> String {
    device
        .reports
        .with_report(report, |r| print_summary(r))
        .unwrap_or_default()
}

pub fn export_report_text(device: &Device, report: ReportHandle, format: ExportFormat) -> String {
    device
        .reports
        .with_report(report, |r| export_report(device, r, format))
        .unwrap_or_default()
}

/// Optional overlay: a pure read of the current report rendered as text at
/// the given viewport position.
pub fn draw_debug(device: &Device, report: ReportHandle, position: (u32, u32), size: (u32, u32)) -> String {
    device
        .reports
        .with_report(report, |r| {
            format!(
                "[{}x{} @ {},{}]\n{}",
                size.0,
                size.1,
                position.0,
                position.1,
                print_summary(r)
            )
        })
        .unwrap_or_default()
}

/// Instrumentation set helpers: OR-masks of the public feature bits.
pub fn instrumentation_set_basic() -> FeatureBits {
    FeatureBits::RESOURCE_ADDRESS_BOUNDS
        | FeatureBits::EXPORT_STABILITY
        | FeatureBits::DESCRIPTOR_ARRAY_BOUNDS
}

pub fn instrumentation_set_concurrency() -> FeatureBits {
    FeatureBits::RESOURCE_DATA_RACE
}

pub fn instrumentation_set_data_residency() -> FeatureBits {
    FeatureBits::RESOURCE_INITIALIZATION
}
