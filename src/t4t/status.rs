//! Status words returned by the Type 4 Tag responder

/// Status Word constants
pub struct SW;

impl SW {
    pub const SUCCESS: u16 = 0x9000;
    /// Also used for every out-of-sequence or malformed command
    pub const FILE_NOT_FOUND: u16 = 0x6A82;

    /// Check if a status word indicates success
    #[inline]
    pub fn is_success(sw: u16) -> bool {
        sw == Self::SUCCESS
    }
}
