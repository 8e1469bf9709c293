use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use cybtldr_dissect::codes::{CodeTable, parse_override};
use cybtldr_dissect::protocol::{self, BootloaderFrame, Direction};
use cybtldr_dissect::transfer::{TransferKind, TransferMetadata, UrbEvent};
use cybtldr_dissect::usbmon::{self, TransferRecord};
use log::{debug, info, warn};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::fmt::Display;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cybtldr-dissect", version, about)]
struct Args {
    /// Add or rename a command code, as CODE=NAME (CODE in decimal or 0x-prefixed hex)
    #[arg(long = "command-name", value_name = "CODE=NAME", value_parser = parse_override, global = true)]
    command_names: Vec<(u8, String)>,

    /// Add or rename a status code, as CODE=NAME (CODE in decimal or 0x-prefixed hex)
    #[arg(long = "status-name", value_name = "CODE=NAME", value_parser = parse_override, global = true)]
    status_names: Vec<(u8, String)>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Decode every bootloader frame in a usbmon text capture
    Decode {
        /// Capture file (as read from /sys/kernel/debug/usb/usbmon/<bus>u); stdin if absent or "-"
        file: Option<PathBuf>,

        /// Only consider transfers on this bus
        #[arg(long)]
        bus: Option<u16>,

        /// Only consider transfers to or from this device address
        #[arg(long)]
        device: Option<u16>,

        /// Also list records that don't hold a bootloader frame
        #[arg(long)]
        show_skipped: bool,

        /// Log malformed lines and carry on instead of stopping
        #[arg(long)]
        keep_going: bool,
    },

    /// Decode a single buffer given as hex
    Frame {
        /// Captured bytes, e.g. "01 38 00 00 c7 ff 17"
        #[arg(num_args = 1.., required = true)]
        data: Vec<String>,

        /// Endpoint number the buffer was captured on
        #[arg(short, long)]
        endpoint: u8,

        /// Whether the buffer was captured on URB submission or completion
        #[arg(long, value_enum)]
        event: EventArg,

        #[arg(long, value_enum, default_value_t = KindArg::Interrupt)]
        kind: KindArg,
    },

    /// Decode buffers typed at a prompt, as "<endpoint> <S|C> <hex>"
    Interactive,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum EventArg {
    Submit,
    Complete,
}

impl From<EventArg> for UrbEvent {
    fn from(event: EventArg) -> Self {
        match event {
            EventArg::Submit => UrbEvent::Submit,
            EventArg::Complete => UrbEvent::Complete,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum KindArg {
    Interrupt,
    Bulk,
    Control,
    Isochronous,
}

impl From<KindArg> for TransferKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Interrupt => TransferKind::Interrupt,
            KindArg::Bulk => TransferKind::Bulk,
            KindArg::Control => TransferKind::Control,
            KindArg::Isochronous => TransferKind::Isochronous,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("CYBTLDR_DISSECT_LOG", "info")
            .write_style("CYBTLDR_DISSECT_LOG_STYLE"),
    )
    .init();

    let args = Args::parse();

    let mut codes = CodeTable::builtin().clone();
    for (code, name) in args.command_names {
        codes = codes.with_command_name(code, name);
    }
    for (code, name) in args.status_names {
        codes = codes.with_status_name(code, name);
    }

    match args.mode {
        Mode::Decode {
            file,
            bus,
            device,
            show_skipped,
            keep_going,
        } => {
            let input: Box<dyn BufRead> = match file {
                Some(path) if path.as_os_str() != "-" => {
                    let file = std::fs::File::open(&path)
                        .with_context(|| format!("opening {}", path.display()))?;
                    Box::new(BufReader::new(file))
                }
                _ => Box::new(std::io::stdin().lock()),
            };

            let filter = Filter { bus, device };
            let mut out = std::io::stdout().lock();
            decode_capture(input, &mut out, &filter, &codes, show_skipped, keep_going)?;
        }
        Mode::Frame {
            data,
            endpoint,
            event,
            kind,
        } => {
            let buffer = parse_hex(&data.concat())?;
            let metadata = TransferMetadata {
                kind: kind.into(),
                endpoint,
                event: event.into(),
            };
            decode_one(&mut std::io::stdout().lock(), &buffer, &metadata, &codes)?;
        }
        Mode::Interactive => interactive(&codes)?,
    };

    Ok(())
}

/// Bus/device address restrictions for `decode`.
struct Filter {
    bus: Option<u16>,
    device: Option<u16>,
}

impl Filter {
    fn matches(&self, record: &TransferRecord) -> bool {
        if let Some(bus) = self.bus {
            // Captures without bus numbers can't be told apart, so let them through.
            if record.bus.is_some_and(|b| b != bus) {
                return false;
            }
        }

        if let Some(device) = self.device {
            if record.device != device {
                return false;
            }
        }

        true
    }
}

/// Counts reported at the end of a `decode` run.
#[derive(Debug, Default, PartialEq)]
struct Summary {
    frames: usize,
    truncated: usize,
    skipped: usize,
}

fn decode_capture(
    input: impl BufRead,
    out: &mut impl Write,
    filter: &Filter,
    codes: &CodeTable,
    show_skipped: bool,
    keep_going: bool,
) -> Result<Summary> {
    let mut summary = Summary::default();
    let mut reader = usbmon::Reader::new(input);

    // Not a `for` loop: the line number is read back from the reader inside the body.
    #[allow(clippy::while_let_on_iterator)]
    while let Some(record) = reader.next() {
        let num = reader.line_num();
        let record = match record {
            Ok(record) => record,
            Err(usbmon::Error::ParseError { line, source }) if keep_going => {
                warn!("Skipping line {line}: {source}");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if !filter.matches(&record) {
            continue;
        }

        match protocol::dissect(&record.data, &record.metadata, codes) {
            Ok(Some(frame)) => {
                summary.frames += 1;
                print_frame(out, format_args!("#{num} {record}"), &frame, codes)?;
            }
            Ok(None) => {
                summary.skipped += 1;
                if show_skipped {
                    writeln!(
                        out,
                        "#{num} {record} {} ({} bytes): not a bootloader frame",
                        record.metadata,
                        record.data.len()
                    )?;
                } else {
                    debug!("Line {num} ({}) is not a bootloader frame", record.metadata);
                }
            }
            Err(e) => {
                summary.truncated += 1;
                writeln!(out, "#{num} {record}: {e}")?;
                if record.is_clipped() {
                    warn!(
                        "usbmon captured only {} of {} bytes on line {num}",
                        record.data.len(),
                        record.reported_len
                    );
                }
            }
        }
    }

    info!(
        "{} bootloader frames, {} truncated, {} other transfers",
        summary.frames, summary.truncated, summary.skipped
    );
    Ok(summary)
}

fn decode_one(
    out: &mut impl Write,
    buffer: &[u8],
    metadata: &TransferMetadata,
    codes: &CodeTable,
) -> Result<()> {
    match protocol::dissect(buffer, metadata, codes)? {
        Some(frame) => print_frame(out, format_args!("ep{}", metadata.endpoint), &frame, codes)?,
        None => writeln!(
            out,
            "{metadata} ({} bytes): not a bootloader frame",
            buffer.len()
        )?,
    }
    Ok(())
}

fn interactive(codes: &CodeTable) -> Result<()> {
    let mut editor = DefaultEditor::new()?;

    loop {
        let line = match editor.readline("> ") {
            Ok(line) => line,
            Err(ReadlineError::Eof | ReadlineError::Interrupted) => break,
            Err(e) => return Err(e.into()),
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        } else if line == "." {
            break;
        }

        if let Err(e) = editor.add_history_entry(line) {
            debug!("Couldn't add history entry: {e}");
        }

        let result = parse_prompt_line(line)
            .and_then(|(metadata, buffer)| {
                decode_one(&mut std::io::stdout().lock(), &buffer, &metadata, codes)
            });
        if let Err(e) = result {
            println!("error: {e:#}");
        }
    }

    Ok(())
}

/// Parse `<endpoint> <S|C> <hex...>` from the interactive prompt.
fn parse_prompt_line(line: &str) -> Result<(TransferMetadata, Vec<u8>)> {
    let mut words = line.split_whitespace();

    let endpoint = words
        .next()
        .ok_or_else(|| anyhow!("missing endpoint"))?
        .parse::<u8>()
        .context("endpoint is not a number")?;
    let event = match words.next() {
        Some("S" | "s") => UrbEvent::Submit,
        Some("C" | "c") => UrbEvent::Complete,
        Some(other) => bail!("expected S or C, got {other:?}"),
        None => bail!("missing S/C"),
    };
    let buffer = parse_hex(&words.collect::<String>())?;

    Ok((TransferMetadata::interrupt(endpoint, event), buffer))
}

/// Accept hex with or without separators, e.g. `0138`, `01 38` or `01:38`.
fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let digits: String = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(&digits).with_context(|| format!("invalid hex data {s:?}"))
}

fn print_frame(
    out: &mut impl Write,
    header: impl Display,
    frame: &BootloaderFrame,
    codes: &CodeTable,
) -> std::io::Result<()> {
    writeln!(out, "{header} {} ({} bytes)", frame.direction, frame.frame_len())?;
    writeln!(out, "  Start of packet: {:#04x}", frame.start_marker)?;
    match frame.direction {
        Direction::Command => writeln!(out, "  Command: {}", frame.discriminator)?,
        Direction::Response => {
            writeln!(out, "  Status: {}", frame.discriminator)?;
            if let Some(description) = codes.status_description(frame.discriminator.code) {
                writeln!(out, "    {description}")?;
            }
        }
    }
    writeln!(out, "  Data length: {}", frame.data_length)?;
    if !frame.payload.is_empty() {
        writeln!(out, "  Payload: {}", hex::encode(&frame.payload))?;
    }
    writeln!(out, "  Checksum: {:#06x}", frame.checksum)?;
    writeln!(out, "  End of packet: {:#04x}", frame.end_marker)?;
    if let Some(leftover) = &frame.leftover {
        writeln!(
            out,
            "  Leftover: {} bytes at {}..{}",
            leftover.len(),
            leftover.start,
            leftover.end
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // A frame, a malformed line, a reply, a mouse report, and a frame usbmon cut short.
    const CAPTURE: &str = "\
# bootloader on 3:007
e3a1fc00 2813460100 S Io:3:007:1 -115:1 64 = 01380000 c7ff1700
broken
e3a1f600 2813462300 C Ii:3:007:2 0:1 64 = 01000000 ffff1700
d1c0a800 2813462500 C Ii:3:002:1 0:8 4 = 00010000
e3a1fc00 2813465000 S Io:3:007:1 -115:1 64 = 01394300 00120040
";

    const NO_FILTER: Filter = Filter {
        bus: None,
        device: None,
    };

    fn run_decode(
        codes: &CodeTable,
        show_skipped: bool,
        keep_going: bool,
    ) -> (Result<Summary>, String) {
        let mut out = Vec::new();
        let result = decode_capture(
            CAPTURE.as_bytes(),
            &mut out,
            &NO_FILTER,
            codes,
            show_skipped,
            keep_going,
        );
        (result, String::from_utf8(out).unwrap())
    }

    #[test]
    fn decode_stops_at_malformed_line() {
        let (result, out) = run_decode(CodeTable::builtin(), false, false);

        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<usbmon::Error>(),
            Some(usbmon::Error::ParseError { line: 3, .. })
        ));
        assert!(out.starts_with("#2 3:007:1 command (7 bytes)\n"));
        assert!(out.contains("  Command: 0x38 (Enter Bootloader)\n"));
        assert!(!out.contains("#4"));
    }

    #[test]
    fn decode_keeps_going() {
        let (result, out) = run_decode(CodeTable::builtin(), false, true);

        assert_eq!(
            result.unwrap(),
            Summary {
                frames: 2,
                truncated: 1,
                skipped: 1
            }
        );
        assert!(out.contains("#2 3:007:1 command (7 bytes)\n"));
        assert!(out.contains("#4 3:007:2 response (7 bytes)\n"));
        assert!(out.contains("  Status: 0x00 (CYRET_SUCCESS)\n"));
        assert!(out.contains("    The command was successfully received and executed.\n"));
        assert!(out.contains("  Leftover: 1 bytes at 7..8\n"));
        assert!(out.contains("#6 3:007:1: frame is truncated: needs 74 bytes, buffer has 8\n"));
        assert!(!out.contains("not a bootloader frame"));
    }

    #[test]
    fn decode_lists_skipped_records() {
        let (result, out) = run_decode(CodeTable::builtin(), true, true);

        assert_eq!(result.unwrap().skipped, 1);
        assert!(out.contains(
            "#5 3:002:1 interrupt ep1 complete (4 bytes): not a bootloader frame\n"
        ));
    }

    #[test]
    fn renamed_status_drops_builtin_description() {
        let codes = CodeTable::builtin().clone().with_status_name(0x00, "OK");
        let (_, out) = run_decode(&codes, false, true);

        assert!(out.contains("  Status: 0x00 (OK)\n"));
        assert!(!out.contains("successfully received"));
    }

    #[test]
    fn prompt_lines() {
        let (meta, buffer) = parse_prompt_line("1 S 01 38 00 00 c7 ff 17").unwrap();
        assert_eq!(meta, TransferMetadata::interrupt(1, UrbEvent::Submit));
        assert_eq!(buffer, [0x01, 0x38, 0x00, 0x00, 0xc7, 0xff, 0x17]);

        let (meta, buffer) = parse_prompt_line("2 c 01:00:00:00:ff:fe:17").unwrap();
        assert_eq!(meta.event, UrbEvent::Complete);
        assert_eq!(buffer.len(), 7);

        assert!(parse_prompt_line("").is_err());
        assert!(parse_prompt_line("x S 01").is_err());
        assert!(parse_prompt_line("1 Q 01").is_err());
        assert!(parse_prompt_line("1 S 0g").is_err());
    }

    #[test]
    fn filter_by_address() {
        let record: TransferRecord = "f7e1b9c0 1 S Io:2:004:1 -115:8 7 = 01380000 c7ff17"
            .parse()
            .unwrap();

        let filter = |bus, device| Filter { bus, device };
        assert!(filter(None, None).matches(&record));
        assert!(filter(Some(2), Some(4)).matches(&record));
        assert!(!filter(Some(1), None).matches(&record));
        assert!(!filter(None, Some(5)).matches(&record));
    }

    #[test]
    fn args_parse() {
        let args = Args::try_parse_from([
            "cybtldr-dissect",
            "frame",
            "--endpoint",
            "1",
            "--event",
            "submit",
            "--command-name",
            "0x4e=Erase Data",
            "01380000",
            "c7ff17",
        ])
        .unwrap();

        assert_eq!(args.command_names, [(0x4e, "Erase Data".to_owned())]);
        match args.mode {
            Mode::Frame {
                data,
                endpoint,
                event,
                kind,
            } => {
                assert_eq!(data.concat(), "01380000c7ff17");
                assert_eq!(endpoint, 1);
                assert!(matches!(event, EventArg::Submit));
                assert!(matches!(kind, KindArg::Interrupt));
            }
            other => panic!("unexpected mode {other:?}"),
        }

        assert!(
            Args::try_parse_from(["cybtldr-dissect", "--status-name", "zz", "interactive"]).is_err()
        );
    }
}
