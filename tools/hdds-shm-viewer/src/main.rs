// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! hdds-shm-viewer - Inspect HDDS transport shared memory segments
//!
//! Lists port segments left in `/dev/shm`, shows who created them, whether
//! that process is still alive and how many messages wait in each queue.
//! `--remove-stale` unlinks segments whose creator is gone.

use clap::Parser;
use colored::*;

#[cfg(target_os = "linux")]
use hdds_transport::config::{DEFAULT_LOCK_TIMEOUT, SEGMENT_PREFIX};
#[cfg(target_os = "linux")]
use hdds_transport::shm::{SharedSegment, ShmError, ShmPort};

/// Inspect HDDS transport shared memory segments
#[derive(Parser, Debug)]
#[command(name = "hdds-shm-viewer")]
#[command(version)]
#[command(about = "Inspect HDDS transport shared memory segments")]
struct Args {
    /// Only show the segments of this port number
    #[arg(short, long)]
    port: Option<u16>,

    /// Show segment identity and layout details
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Output format: pretty, json
    #[arg(short, long, default_value = "pretty")]
    format: OutputFormat,

    /// Show only summary statistics
    #[arg(short, long)]
    summary: bool,

    /// Unlink segments whose creator process is gone
    #[arg(long)]
    remove_stale: bool,

    /// Specific segment name to inspect (without /dev/shm prefix)
    #[arg()]
    segment: Option<String>,
}

#[derive(Clone, Debug)]
enum OutputFormat {
    Pretty,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "p" => Ok(OutputFormat::Pretty),
            "json" | "j" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown format: {}", s)),
        }
    }
}

/// Information about one segment
#[derive(Debug)]
struct SegmentInfo {
    name: String,
    size: u64,
    segment_type: SegmentType,
    id: Option<String>,
    creator_pid: Option<u32>,
    stale: bool,
    removed: bool,
    port: Option<PortInfo>,
    error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentType {
    Unicast,
    Multicast,
    Other,
}

impl SegmentType {
    fn from_name(name: &str) -> Self {
        let bare = name.trim_start_matches('/');
        match bare.strip_prefix("hdds_port") {
            Some(rest) if rest.contains("_m") => SegmentType::Multicast,
            Some(_) => SegmentType::Unicast,
            None => SegmentType::Other,
        }
    }

    fn label(self) -> &'static str {
        match self {
            SegmentType::Unicast => "unicast",
            SegmentType::Multicast => "multicast",
            SegmentType::Other => "other",
        }
    }
}

/// Queue state of a port segment
#[derive(Debug)]
struct PortInfo {
    capacity: usize,
    max_message_size: usize,
    pending: usize,
    closed: bool,
}

#[cfg(target_os = "linux")]
fn main() {
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("hdds-shm-viewer: shared memory transport is only available on Linux");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if !std::path::Path::new("/dev/shm").exists() {
        return Err("Shared memory directory /dev/shm not found".into());
    }

    let names = if let Some(ref name) = args.segment {
        vec![format!("/{}", name.trim_start_matches('/'))]
    } else {
        let prefix = match args.port {
            Some(port) => format!("{}port{}", SEGMENT_PREFIX, port),
            None => SEGMENT_PREFIX.to_string(),
        };
        let mut names = SharedSegment::list(&prefix);
        if let Some(port) = args.port {
            // "hdds_port74" must not match "hdds_port7411"
            let exact = format!("/{}port{}", SEGMENT_PREFIX, port);
            let member = format!("{}_m", exact);
            names.retain(|n| *n == exact || n.starts_with(&member));
        }
        names
    };

    let segments: Vec<SegmentInfo> = names
        .iter()
        .map(|name| inspect_segment(name, args.remove_stale))
        .collect();

    match args.format {
        OutputFormat::Pretty => print_pretty(&segments, args),
        OutputFormat::Json => print_json(&segments),
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn inspect_segment(name: &str, remove_stale: bool) -> SegmentInfo {
    let mut info = SegmentInfo {
        name: name.trim_start_matches('/').to_string(),
        size: 0,
        segment_type: SegmentType::from_name(name),
        id: None,
        creator_pid: None,
        stale: false,
        removed: false,
        port: None,
        error: None,
    };

    let segment = match SharedSegment::open(name) {
        Ok(segment) => segment,
        Err(e) => {
            info.error = Some(e.to_string());
            return info;
        }
    };
    info.size = segment.size() as u64;
    info.id = Some(segment.id().to_string());
    info.creator_pid = Some(segment.creator_pid());
    info.stale = segment.is_stale();
    drop(segment);

    if info.segment_type != SegmentType::Other {
        match ShmPort::open(name, DEFAULT_LOCK_TIMEOUT) {
            Ok(port) => {
                info.port = Some(PortInfo {
                    capacity: port.capacity(),
                    max_message_size: port.max_message_size(),
                    pending: port.len(),
                    closed: port.is_closed(),
                });
            }
            Err(ShmError::StaleLock { pid }) => {
                info.error = Some(format!("queue lock held by dead process {}", pid));
            }
            Err(e) => info.error = Some(e.to_string()),
        }
    }

    if remove_stale && info.stale {
        match SharedSegment::remove_if_stale(name) {
            Ok(removed) => info.removed = removed,
            Err(e) => info.error = Some(format!("remove failed: {}", e)),
        }
    }

    info
}

fn print_pretty(segments: &[SegmentInfo], args: &Args) {
    if segments.is_empty() {
        println!("{}", "No HDDS shared memory segments found".yellow());
        return;
    }

    if args.summary {
        print_summary(segments);
        return;
    }

    println!();
    println!("{}", "=== HDDS Shared Memory Segments ===".bold());
    println!();

    for seg in segments {
        let type_badge = match seg.segment_type {
            SegmentType::Unicast => "UNICAST".green(),
            SegmentType::Multicast => "MULTICAST".blue(),
            SegmentType::Other => "OTHER".yellow(),
        };
        let state_badge = if seg.removed {
            "REMOVED".magenta()
        } else if seg.stale {
            "STALE".red()
        } else {
            "LIVE".green()
        };

        println!(
            "  {} {} [{}] ({})",
            type_badge,
            seg.name.cyan(),
            state_badge,
            format_size(seg.size)
        );

        if let Some(pid) = seg.creator_pid {
            println!("      Creator pid: {}", pid);
        }
        if args.verbose {
            if let Some(ref id) = seg.id {
                println!("      Segment id: {}", id.dimmed());
            }
        }

        if let Some(ref port) = seg.port {
            let pending = if port.pending > 0 {
                port.pending.to_string().yellow()
            } else {
                port.pending.to_string().normal()
            };
            if args.verbose {
                println!(
                    "      Capacity: {} slots  Max message: {} bytes",
                    port.capacity, port.max_message_size
                );
                let usage_pct = if port.capacity > 0 {
                    (port.pending as f64 / port.capacity as f64) * 100.0
                } else {
                    0.0
                };
                println!(
                    "      Queue fill: {}/{} ({:.1}%){}",
                    pending,
                    port.capacity,
                    usage_pct,
                    if port.closed { "  CLOSED" } else { "" }
                );
            } else {
                println!(
                    "      pending={} cap={} max_msg={}B{}",
                    pending,
                    port.capacity,
                    port.max_message_size,
                    if port.closed { " closed" } else { "" }
                );
            }
        }

        if let Some(ref err) = seg.error {
            println!("      {}: {}", "Error".red(), err);
        }

        println!();
    }

    let totals = Totals::of(segments);
    println!("{}", "--- Summary ---".dimmed());
    println!(
        "  Segments: {} ({} unicast, {} multicast, {} stale, {} removed)",
        segments.len(),
        totals.unicast,
        totals.multicast,
        totals.stale,
        totals.removed
    );
    println!("  Total size: {}", format_size(totals.size));
    println!("  Pending messages: {}", totals.pending);
    println!();
}

#[derive(Default)]
struct Totals {
    size: u64,
    pending: usize,
    unicast: usize,
    multicast: usize,
    stale: usize,
    removed: usize,
}

impl Totals {
    fn of(segments: &[SegmentInfo]) -> Self {
        let mut totals = Totals::default();
        for seg in segments {
            totals.size += seg.size;
            match seg.segment_type {
                SegmentType::Unicast => totals.unicast += 1,
                SegmentType::Multicast => totals.multicast += 1,
                SegmentType::Other => {}
            }
            if seg.stale {
                totals.stale += 1;
            }
            if seg.removed {
                totals.removed += 1;
            }
            if let Some(ref port) = seg.port {
                totals.pending += port.pending;
            }
        }
        totals
    }
}

fn print_summary(segments: &[SegmentInfo]) {
    let totals = Totals::of(segments);
    println!(
        "segments={} unicast={} multicast={} stale={} removed={} size={} pending={}",
        segments.len(),
        totals.unicast,
        totals.multicast,
        totals.stale,
        totals.removed,
        totals.size,
        totals.pending
    );
}

fn print_json(segments: &[SegmentInfo]) {
    print!("{{\"segments\":[");

    for (i, seg) in segments.iter().enumerate() {
        if i > 0 {
            print!(",");
        }

        print!(
            "{{\"name\":\"{}\",\"type\":\"{}\",\"size\":{},\"stale\":{},\"removed\":{}",
            json_escape(&seg.name),
            seg.segment_type.label(),
            seg.size,
            seg.stale,
            seg.removed
        );

        if let Some(ref id) = seg.id {
            print!(",\"id\":\"{}\"", json_escape(id));
        }
        if let Some(pid) = seg.creator_pid {
            print!(",\"creator_pid\":{}", pid);
        }

        if let Some(ref port) = seg.port {
            print!(
                ",\"port\":{{\"capacity\":{},\"max_message_size\":{},\"pending\":{},\"closed\":{}}}",
                port.capacity, port.max_message_size, port.pending, port.closed
            );
        }

        if let Some(ref err) = seg.error {
            print!(",\"error\":\"{}\"", json_escape(err));
        }

        print!("}}");
    }

    println!("]}}");
}

/// Escape `s` for use inside a JSON string literal.
fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if u32::from(c) < 0x20 => out.push_str(&format!("\\u{:04x}", u32::from(c))),
            c => out.push(c),
        }
    }
    out
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_type_from_name() {
        assert_eq!(SegmentType::from_name("/hdds_port7411"), SegmentType::Unicast);
        assert_eq!(
            SegmentType::from_name("hdds_port7400_m1234_0"),
            SegmentType::Multicast
        );
        assert_eq!(SegmentType::from_name("/hdds_probe_1_abc"), SegmentType::Other);
    }

    #[test]
    fn test_json_escape() {
        assert_eq!(json_escape("hdds_port7411"), "hdds_port7411");
        assert_eq!(
            json_escape("bad \"name\" in C:\\shm\nnext"),
            "bad \\\"name\\\" in C:\\\\shm\\nnext"
        );
        assert_eq!(json_escape("tab\there\r"), "tab\\there\\r");
        assert_eq!(json_escape("\u{1}"), "\\u0001");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }
}
