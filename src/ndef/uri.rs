//! URI identifier codes of the NFC Forum URI record type

/// Prefix for each identifier code; the index is the code
pub const URI_PREFIXES: [&str; 36] = [
    "",
    "http://www.",
    "https://www.",
    "http://",
    "https://",
    "tel:",
    "mailto:",
    "ftp://anonymous:anonymous@",
    "ftp://ftp.",
    "ftps://",
    "sftp://",
    "smb://",
    "nfs://",
    "ftp://",
    "dav://",
    "news:",
    "telnet://",
    "imap:",
    "rtsp://",
    "urn:",
    "pop:",
    "sip:",
    "sips:",
    "tftp:",
    "btspp://",
    "btl2cap://",
    "btgoep://",
    "tcpobex://",
    "irdaobex://",
    "file://",
    "urn:epc:id:",
    "urn:epc:tag:",
    "urn:epc:pat:",
    "urn:epc:raw:",
    "urn:epc:",
    "urn:nfc:",
];

/// Split `uri` into the code of its longest known prefix and the remainder
pub fn abbreviate(uri: &str) -> (u8, &str) {
    URI_PREFIXES
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, prefix)| uri.starts_with(*prefix))
        .max_by_key(|(_, prefix)| prefix.len())
        .map(|(code, prefix)| (code as u8, &uri[prefix.len()..]))
        .unwrap_or((0, uri))
}

/// Rebuild a URI from its identifier code and remainder; unknown codes
/// expand to nothing
pub fn expand(code: u8, rest: &str) -> String {
    let prefix = URI_PREFIXES.get(code as usize).copied().unwrap_or("");
    format!("{}{}", prefix, rest)
}
