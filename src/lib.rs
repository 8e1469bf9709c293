/// Built-in names for command and status codes, and overrides for new firmware revisions.
pub mod codes;

/// Classify captured interrupt transfers and decode Cypress bootloader frames from them.
pub mod protocol;

/// Transfer metadata supplied alongside each captured buffer.
pub mod transfer;

/// Read transfer records from Linux usbmon text captures.
pub mod usbmon;
