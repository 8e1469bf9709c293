use num_enum::TryFromPrimitive;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::LazyLock;
use thiserror::Error;

/// Commands understood by the bootloader, sent by the host on the OUT endpoint.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
pub enum Command {
    VerifyChecksum = 0x31,
    GetFlashSize = 0x32,
    GetAppStatus = 0x33,
    EraseRow = 0x34,
    Sync = 0x35,
    SetActiveApp = 0x36,
    SendData = 0x37,
    EnterBootloader = 0x38,
    ProgramRow = 0x39,
    VerifyRow = 0x3a,
    ExitBootloader = 0x3b,
    GetMetadata = 0x3c,
    SetEiv = 0x4d,
}

impl Command {
    pub const ALL: [Command; 13] = [
        Command::VerifyChecksum,
        Command::GetFlashSize,
        Command::GetAppStatus,
        Command::EraseRow,
        Command::Sync,
        Command::SetActiveApp,
        Command::SendData,
        Command::EnterBootloader,
        Command::ProgramRow,
        Command::VerifyRow,
        Command::ExitBootloader,
        Command::GetMetadata,
        Command::SetEiv,
    ];

    pub fn name(&self) -> &'static str {
        use Command::*;
        match self {
            VerifyChecksum => "Verify Checksum",
            GetFlashSize => "Get Flash Size",
            GetAppStatus => "Get Application Status",
            EraseRow => "Erase Row",
            Sync => "Sync Bootloader",
            SetActiveApp => "Set Active Application",
            SendData => "Send Data",
            EnterBootloader => "Enter Bootloader",
            ProgramRow => "Program Row",
            VerifyRow => "Verify Row",
            ExitBootloader => "Exit Bootloader",
            GetMetadata => "Get Metadata",
            SetEiv => "Set Encryption Initial Vector",
        }
    }
}

/// Status codes the bootloader returns on the IN endpoint.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[allow(non_camel_case_types)] // Names from the bootloader's headers
pub enum Status {
    CYRET_SUCCESS = 0x00,
    CYRET_ERR_KEY = 0x01,
    CYRET_ERR_VERIFY = 0x02,
    CYRET_ERR_LENGTH = 0x03,
    CYRET_ERR_DATA = 0x04,
    CYRET_ERR_CMD = 0x05,
    CYRET_ERR_DEVICE = 0x06,
    CYRET_ERR_VERSION = 0x07,
    CYRET_ERR_CHECKSUM = 0x08,
    CYRET_ERR_ARRAY = 0x09,
    CYRET_ERR_ROW = 0x0a,
}

impl Status {
    pub const ALL: [Status; 11] = [
        Status::CYRET_SUCCESS,
        Status::CYRET_ERR_KEY,
        Status::CYRET_ERR_VERIFY,
        Status::CYRET_ERR_LENGTH,
        Status::CYRET_ERR_DATA,
        Status::CYRET_ERR_CMD,
        Status::CYRET_ERR_DEVICE,
        Status::CYRET_ERR_VERSION,
        Status::CYRET_ERR_CHECKSUM,
        Status::CYRET_ERR_ARRAY,
        Status::CYRET_ERR_ROW,
    ];

    pub fn name(&self) -> &'static str {
        use Status::*;
        match self {
            CYRET_SUCCESS => "CYRET_SUCCESS",
            CYRET_ERR_KEY => "CYRET_ERR_KEY",
            CYRET_ERR_VERIFY => "CYRET_ERR_VERIFY",
            CYRET_ERR_LENGTH => "CYRET_ERR_LENGTH",
            CYRET_ERR_DATA => "CYRET_ERR_DATA",
            CYRET_ERR_CMD => "CYRET_ERR_CMD",
            CYRET_ERR_DEVICE => "CYRET_ERR_DEVICE",
            CYRET_ERR_VERSION => "CYRET_ERR_VERSION",
            CYRET_ERR_CHECKSUM => "CYRET_ERR_CHECKSUM",
            CYRET_ERR_ARRAY => "CYRET_ERR_ARRAY",
            CYRET_ERR_ROW => "CYRET_ERR_ROW",
        }
    }

    pub fn description(&self) -> &'static str {
        use Status::*;
        match self {
            CYRET_SUCCESS => "The command was successfully received and executed.",
            CYRET_ERR_KEY => "The provided key does not match the expected value.",
            CYRET_ERR_VERIFY => "The verification of flash failed.",
            CYRET_ERR_LENGTH => "The amount of data available is outside the expected range.",
            CYRET_ERR_DATA => "The data is not of the proper form.",
            CYRET_ERR_CMD => "The command is not recognized.",
            CYRET_ERR_DEVICE => "The expected device does not match the detected device.",
            CYRET_ERR_VERSION => "The bootloader version detected is not supported.",
            CYRET_ERR_CHECKSUM => "The checksum does not match the expected value.",
            CYRET_ERR_ARRAY => "The flash array is not valid.",
            CYRET_ERR_ROW => "The flash row is not valid.",
        }
    }
}

static BUILTIN: LazyLock<CodeTable> = LazyLock::new(|| CodeTable {
    commands: Command::ALL
        .iter()
        .map(|c| (*c as u8, Cow::Borrowed(c.name())))
        .collect(),
    statuses: Status::ALL
        .iter()
        .map(|s| (*s as u8, Cow::Borrowed(s.name())))
        .collect(),
});

/// Names for command and status codes. Starts out as the built-in tables; firmware revisions with
/// extra codes can be covered by overriding or adding entries on a clone.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CodeTable {
    commands: HashMap<u8, Cow<'static, str>>,
    statuses: HashMap<u8, Cow<'static, str>>,
}

impl CodeTable {
    /// The shared table of codes known to this crate.
    pub fn builtin() -> &'static CodeTable {
        &BUILTIN
    }

    pub fn command_name(&self, code: u8) -> Option<&str> {
        self.commands.get(&code).map(|n| n.as_ref())
    }

    pub fn status_name(&self, code: u8) -> Option<&str> {
        self.statuses.get(&code).map(|n| n.as_ref())
    }

    // Built-in names stay borrowed when cloned into a decoded frame.
    pub(crate) fn command_entry(&self, code: u8) -> Option<&Cow<'static, str>> {
        self.commands.get(&code)
    }

    pub(crate) fn status_entry(&self, code: u8) -> Option<&Cow<'static, str>> {
        self.statuses.get(&code)
    }

    /// Longer explanation for a built-in status code. [None] once the code has been renamed, since
    /// the description may no longer fit.
    pub fn status_description(&self, code: u8) -> Option<&'static str> {
        let status = Status::try_from(code).ok()?;
        if self.status_name(code) == Some(status.name()) {
            Some(status.description())
        } else {
            None
        }
    }

    pub fn with_command_name(mut self, code: u8, name: impl Into<Cow<'static, str>>) -> Self {
        self.commands.insert(code, name.into());
        self
    }

    pub fn with_status_name(mut self, code: u8, name: impl Into<Cow<'static, str>>) -> Self {
        self.statuses.insert(code, name.into());
        self
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    pub fn status_count(&self) -> usize {
        self.statuses.len()
    }
}

/// Failure to parse a `CODE=NAME` override.
#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum OverrideError {
    #[error("expected CODE=NAME, got {0:?}")]
    MissingSeparator(String),

    #[error("code {0:?} is not a byte value (use decimal or 0x-prefixed hex)")]
    BadCode(String),

    #[error("name for code {0:#04x} is empty")]
    EmptyName(u8),
}

/// Parse a `CODE=NAME` pair, where CODE is decimal or `0x`-prefixed hex.
pub fn parse_override(s: &str) -> Result<(u8, String), OverrideError> {
    let (code, name) = s
        .split_once('=')
        .ok_or_else(|| OverrideError::MissingSeparator(s.to_owned()))?;

    let code = code.trim();
    let parsed = match code.strip_prefix("0x").or_else(|| code.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => code.parse(),
    }
    .map_err(|_| OverrideError::BadCode(code.to_owned()))?;

    let name = name.trim();
    if name.is_empty() {
        return Err(OverrideError::EmptyName(parsed));
    }

    Ok((parsed, name.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_sizes() {
        let table = CodeTable::builtin();
        assert_eq!(table.command_count(), 13);
        assert_eq!(table.status_count(), 11);
    }

    #[test]
    fn builtin_names() {
        let table = CodeTable::builtin();
        assert_eq!(table.command_name(0x38), Some("Enter Bootloader"));
        assert_eq!(table.command_name(0x3b), Some("Exit Bootloader"));
        assert_eq!(table.status_name(0x00), Some("CYRET_SUCCESS"));
        assert_eq!(table.status_name(0x08), Some("CYRET_ERR_CHECKSUM"));

        assert_eq!(table.command_name(0x00), None);
        assert_eq!(table.status_name(0x38), None);
    }

    #[test]
    fn enum_round_trip() {
        assert_eq!(Command::try_from(0x39).ok(), Some(Command::ProgramRow));
        assert!(Command::try_from(0x30).is_err());
        assert_eq!(Status::try_from(0x0a).ok(), Some(Status::CYRET_ERR_ROW));
        assert!(Status::try_from(0x0f).is_err());
    }

    #[test]
    fn status_descriptions() {
        let table = CodeTable::builtin();
        assert_eq!(
            table.status_description(0x05),
            Some("The command is not recognized.")
        );
        assert_eq!(table.status_description(0xff), None);

        let renamed = table
            .clone()
            .with_status_name(0x05, "BAD_COMMAND")
            .with_status_name(0x0f, "CYRET_ERR_UNK");
        assert_eq!(renamed.status_description(0x05), None);
        assert_eq!(renamed.status_description(0x0f), None);
        assert_eq!(
            renamed.status_description(0x00),
            Some("The command was successfully received and executed.")
        );
    }

    #[test]
    fn builtin_entries_are_borrowed() {
        let table = CodeTable::builtin()
            .clone()
            .with_command_name(0x4e, String::from("Erase Data"));
        assert!(matches!(table.command_entry(0x38), Some(Cow::Borrowed(_))));
        assert!(matches!(table.status_entry(0x00), Some(Cow::Borrowed(_))));
        assert!(matches!(table.command_entry(0x4e), Some(Cow::Owned(_))));
    }

    #[test]
    fn overrides_do_not_touch_builtin() {
        let table = CodeTable::builtin()
            .clone()
            .with_command_name(0x4e, "Erase Data")
            .with_status_name(0x00, "OK");

        assert_eq!(table.command_name(0x4e), Some("Erase Data"));
        assert_eq!(table.status_name(0x00), Some("OK"));
        assert_eq!(table.command_count(), 14);

        assert_eq!(CodeTable::builtin().command_name(0x4e), None);
        assert_eq!(CodeTable::builtin().status_name(0x00), Some("CYRET_SUCCESS"));
    }

    #[test]
    fn parse_overrides() {
        assert_eq!(
            parse_override("0x4e=Erase Data"),
            Ok((0x4e, "Erase Data".to_owned()))
        );
        assert_eq!(parse_override("15 = UNK"), Ok((15, "UNK".to_owned())));

        assert_eq!(
            parse_override("0x4e"),
            Err(OverrideError::MissingSeparator("0x4e".to_owned()))
        );
        assert_eq!(
            parse_override("0x100=Big"),
            Err(OverrideError::BadCode("0x100".to_owned()))
        );
        assert_eq!(
            parse_override("abc=Name"),
            Err(OverrideError::BadCode("abc".to_owned()))
        );
        assert_eq!(parse_override("7= "), Err(OverrideError::EmptyName(7)));
    }
}
