use std::fmt::Display;

/// USB transfer types, as reported by the capture layer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransferKind {
    Control,
    Isochronous,
    Interrupt,
    Bulk,
}

impl Display for TransferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TransferKind::Control => write!(f, "control"),
            TransferKind::Isochronous => write!(f, "isochronous"),
            TransferKind::Interrupt => write!(f, "interrupt"),
            TransferKind::Bulk => write!(f, "bulk"),
        }
    }
}

/// Which point in a URB's life a capture record was taken at. Outbound data is visible on
/// submission; inbound data only once the URB completes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UrbEvent {
    Submit,
    Complete,
    /// Submission failed. Never carries a bootloader frame.
    Error,
}

impl Display for UrbEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            UrbEvent::Submit => write!(f, "submit"),
            UrbEvent::Complete => write!(f, "complete"),
            UrbEvent::Error => write!(f, "error"),
        }
    }
}

/// Out-of-band information about a captured transfer. Everything the classifier needs besides the
/// bytes themselves.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransferMetadata {
    pub kind: TransferKind,
    /// Endpoint number without the direction bit.
    pub endpoint: u8,
    pub event: UrbEvent,
}

impl TransferMetadata {
    pub const fn interrupt(endpoint: u8, event: UrbEvent) -> Self {
        Self {
            kind: TransferKind::Interrupt,
            endpoint,
            event,
        }
    }
}

impl Display for TransferMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} ep{} {}", self.kind, self.endpoint, self.event)
    }
}
