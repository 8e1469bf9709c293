use crate::transfer::{TransferKind, TransferMetadata, UrbEvent};
use log::trace;
use std::fmt::Display;
use std::io::BufRead;
use std::str::FromStr;
use thiserror::Error;

/// Direction bit of the endpoint a URB was queued on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EndpointDirection {
    In,
    Out,
}

/// One line of a usbmon text capture: a single URB submission, completion, or error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferRecord {
    /// Kernel URB address. Shared by the submit and complete records of the same URB.
    pub tag: String,
    pub timestamp_us: u64,
    pub metadata: TransferMetadata,
    pub direction: EndpointDirection,
    /// Old kernels don't print the bus number.
    pub bus: Option<u16>,
    pub device: u16,
    /// Transfer length reported by the kernel. May exceed `data.len()`, since the text interface
    /// only captures the first 32 bytes of each URB.
    pub reported_len: usize,
    pub data: Vec<u8>,
}

impl TransferRecord {
    /// True if usbmon captured some, but not all, of this URB's data.
    pub fn is_clipped(&self) -> bool {
        !self.data.is_empty() && self.data.len() < self.reported_len
    }
}

impl Display for TransferRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let Some(bus) = self.bus {
            write!(f, "{bus}:")?;
        }
        write!(f, "{:03}:{}", self.device, self.metadata.endpoint)
    }
}

/// Problems with a single usbmon line.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("expected at least 4 fields, got {0}")]
    TooFewFields(usize),

    #[error("unknown event type {0:?}")]
    BadEvent(String),

    #[error("malformed address {0:?}")]
    BadAddress(String),

    #[error("unknown transfer type {0:?}")]
    BadTransferType(char),

    #[error("invalid {field}: {value:?}")]
    BadNumber { field: &'static str, value: String },

    #[error("data tag without a length before it")]
    MissingLength,

    #[error("invalid data word {word:?}")]
    BadData {
        word: String,
        source: hex::FromHexError,
    },
}

fn parse_num<T: FromStr>(field: &'static str, value: &str) -> Result<T, ParseError> {
    value.parse().map_err(|_| ParseError::BadNumber {
        field,
        value: value.to_owned(),
    })
}

/// Parse the address word, e.g. `Ii:1:004:2` or the bus-less `Ii:004:2`.
fn parse_address(
    word: &str,
) -> Result<(TransferKind, EndpointDirection, Option<u16>, u16, u8), ParseError> {
    let bad = || ParseError::BadAddress(word.to_owned());

    let mut parts = word.split(':');
    let mut type_dir = parts.next().ok_or_else(bad)?.chars();
    let numbers: Vec<&str> = parts.collect();

    let kind = match type_dir.next() {
        Some('C') => TransferKind::Control,
        Some('Z') => TransferKind::Isochronous,
        Some('I') => TransferKind::Interrupt,
        Some('B') => TransferKind::Bulk,
        Some(c) => return Err(ParseError::BadTransferType(c)),
        None => return Err(bad()),
    };
    let direction = match (type_dir.next(), type_dir.next()) {
        (Some('i'), None) => EndpointDirection::In,
        (Some('o'), None) => EndpointDirection::Out,
        _ => return Err(bad()),
    };

    let (bus, device, endpoint) = match numbers.as_slice() {
        [bus, device, endpoint] => (Some(parse_num("bus", bus)?), *device, *endpoint),
        [device, endpoint] => (None, *device, *endpoint),
        _ => return Err(bad()),
    };

    Ok((
        kind,
        direction,
        bus,
        parse_num("device", device)?,
        parse_num("endpoint", endpoint)?,
    ))
}

impl FromStr for TransferRecord {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            return Err(ParseError::TooFewFields(fields.len()));
        }

        let event = match fields[2] {
            "S" => UrbEvent::Submit,
            "C" => UrbEvent::Complete,
            "E" => UrbEvent::Error,
            other => return Err(ParseError::BadEvent(other.to_owned())),
        };
        let (kind, direction, bus, device, endpoint) = parse_address(fields[3])?;

        // What sits between the address and the data depends on the transfer type (setup packet,
        // interval, ISO descriptors), but the data length always directly precedes the data tag.
        let rest = &fields[4..];
        let (reported_len, data) = match rest.iter().position(|f| matches!(*f, "=" | "<" | ">")) {
            Some(0) => return Err(ParseError::MissingLength),
            Some(tag) => {
                let len = parse_num("data length", rest[tag - 1])?;
                let mut data = Vec::new();
                if rest[tag] == "=" {
                    for word in &rest[tag + 1..] {
                        let bytes = hex::decode(word).map_err(|source| ParseError::BadData {
                            word: (*word).to_owned(),
                            source,
                        })?;
                        data.extend_from_slice(&bytes);
                    }
                }
                (len, data)
            }
            None => (
                rest.last().and_then(|f| f.parse().ok()).unwrap_or(0),
                Vec::new(),
            ),
        };

        Ok(TransferRecord {
            tag: fields[0].to_owned(),
            timestamp_us: parse_num("timestamp", fields[1])?,
            metadata: TransferMetadata {
                kind,
                endpoint,
                event,
            },
            direction,
            bus,
            device,
            reported_len,
            data,
        })
    }
}

/// Errors that can happen while reading a usbmon capture.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("malformed usbmon record on line {line}")]
    ParseError { line: usize, source: ParseError },

    #[error("I/O error")]
    IoError(#[from] std::io::Error),
}

/// Iterates over the records of a usbmon text capture, skipping blank lines and `#` comments.
pub struct Reader<R> {
    input: R,
    line_num: usize,
    line: String,
}

impl<R: BufRead> Reader<R> {
    pub fn new(input: R) -> Self {
        Reader {
            input,
            line_num: 0,
            line: String::new(),
        }
    }

    /// 1-based number of the line most recently read.
    pub fn line_num(&self) -> usize {
        self.line_num
    }
}

impl<R: BufRead> Iterator for Reader<R> {
    type Item = Result<TransferRecord, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line.clear();
            match self.input.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) => self.line_num += 1,
                Err(e) => return Some(Err(e.into())),
            }

            let line = self.line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            trace!("usbmon line {}: {line}", self.line_num);
            return Some(line.parse().map_err(|source| Error::ParseError {
                line: self.line_num,
                source,
            }));
        }
    }
}
