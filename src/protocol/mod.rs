//! The host transfer protocol: fixed-width ASCII tokens, hex-encoded words, and raw payloads.

pub mod image;
pub mod session;
pub mod wire;

/// Width of every control token, not counting its NUL terminator
pub const TOKEN_LEN: usize = 7;

/// Control tokens, exactly as they appear on the wire (before the NUL)
pub mod token {
    pub const START: &str = "  START";
    pub const BOOTUBL: &str = "BOOTUBL";
    pub const CMD: &str = "    CMD";
    pub const DONE: &str = "   DONE";
    pub const FAIL: &str = "   FAIL";
    pub const SENDIMG: &str = "SENDIMG";
    pub const ACK: &str = "    ACK";
    pub const BEGIN: &str = "  BEGIN";
    pub const BADCNT: &str = " BADCNT";
    pub const BADADDR: &str = "BADADDR";
    pub const SIZE: &str = "   SIZE";
    pub const SENDING: &str = "SENDING";
}

/// Literal that closes the wire header; sent without a NUL
pub const HEADER_TERMINATOR: &str = "0000";

/// Operations the host can ask for
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Command {
    /// Application image only; no loader
    FlashNoUbl,

    /// Loader image, then application image
    Flash,

    /// Erase the boot area (or whole device)
    Erase,

    /// DSP loader, ARM loader, then application (dual-core parts)
    FlashDsp,

    /// End of session
    Finished,
}

impl Command {
    pub const FLASH_NO_UBL: u32 = 0x5542_4C00;
    pub const FLASH: u32 = 0x5542_4C10;
    pub const ERASE: u32 = 0x5542_4C20;
    pub const FLASH_DSP: u32 = 0x5542_4C30;
    pub const FINISHED: u32 = 0x5542_4CFF;

    pub fn from_word(word: u32) -> Option<Self> {
        match word {
            Self::FLASH_NO_UBL => Some(Command::FlashNoUbl),
            Self::FLASH => Some(Command::Flash),
            Self::ERASE => Some(Command::Erase),
            Self::FLASH_DSP => Some(Command::FlashDsp),
            Self::FINISHED => Some(Command::Finished),
            _ => None,
        }
    }

    pub fn word(self) -> u32 {
        match self {
            Command::FlashNoUbl => Self::FLASH_NO_UBL,
            Command::Flash => Self::FLASH,
            Command::Erase => Self::ERASE,
            Command::FlashDsp => Self::FLASH_DSP,
            Command::Finished => Self::FINISHED,
        }
    }
}

#[test]
fn test_command_words() {
    for cmd in [
        Command::FlashNoUbl,
        Command::Flash,
        Command::Erase,
        Command::FlashDsp,
        Command::Finished,
    ] {
        assert_eq!(Command::from_word(cmd.word()), Some(cmd));
    }
    assert_eq!(Command::from_word(0x5542_4C40), None);
    assert!([
        token::START,
        token::BOOTUBL,
        token::CMD,
        token::DONE,
        token::FAIL,
        token::SENDIMG,
        token::ACK,
        token::BEGIN,
        token::BADCNT,
        token::BADADDR,
        token::SIZE,
        token::SENDING,
    ]
    .iter()
    .all(|t| t.len() == TOKEN_LEN));
}
