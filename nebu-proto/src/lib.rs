//! NEBU provisioning protocol - credential framing and acknowledgements

use std::io;

pub mod api;
pub mod ble;

/// Credential frame version
pub const FRAME_VERSION: u8 = 1;

// WiFi credential limits (802.11 / WPA2-PSK)
pub const MAX_SSID_LEN: usize = 32;
pub const MIN_PASSPHRASE_LEN: usize = 8;
pub const MAX_PASSPHRASE_LEN: usize = 63;

// Chunk header bits
pub const CHUNK_FINAL: u8 = 0x80;
pub const CHUNK_INDEX_MASK: u8 = 0x7f;

// Acknowledgement codes written back on the status characteristic
pub const ACK_OK: u8 = 0x00;
pub const ACK_BAD_CREDENTIALS: u8 = 0x01;
pub const ACK_UNSUPPORTED: u8 = 0x02;

const CHECKSUM_LEN: usize = 4;

/// Check SSID / passphrase lengths against WPA2-PSK limits
pub fn check_credential_lengths(ssid: &[u8], passphrase: &[u8]) -> Result<(), &'static str> {
    if ssid.is_empty() || ssid.len() > MAX_SSID_LEN {
        return Err("SSID must be 1-32 bytes");
    }
    if !passphrase.is_empty()
        && (passphrase.len() < MIN_PASSPHRASE_LEN || passphrase.len() > MAX_PASSPHRASE_LEN)
    {
        return Err("passphrase must be empty or 8-63 bytes");
    }
    Ok(())
}

fn checksum(data: &[u8]) -> [u8; CHECKSUM_LEN] {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(data);
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Decoded credential frame
///
/// Layout: `version | sequence:u32 | ssid_len:u8 | ssid | pass_len:u8 | passphrase | checksum:[u8;4]`
#[derive(Clone)]
pub struct CredentialFrame {
    pub sequence: u32,
    pub ssid: Vec<u8>,
    pub passphrase: Vec<u8>,
}

impl std::fmt::Debug for CredentialFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialFrame")
            .field("sequence", &self.sequence)
            .field("ssid_len", &self.ssid.len())
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

impl CredentialFrame {
    /// Encode a frame straight from borrowed credential bytes
    ///
    /// The returned buffer contains the passphrase; callers own wiping it.
    pub fn encode(sequence: u32, ssid: &[u8], passphrase: &[u8]) -> io::Result<Vec<u8>> {
        check_credential_lengths(ssid, passphrase)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut buf = Vec::with_capacity(1 + 4 + 1 + ssid.len() + 1 + passphrase.len() + CHECKSUM_LEN);
        buf.push(FRAME_VERSION);
        buf.extend_from_slice(&sequence.to_be_bytes());
        buf.push(ssid.len() as u8);
        buf.extend_from_slice(ssid);
        buf.push(passphrase.len() as u8);
        buf.extend_from_slice(passphrase);
        let sum = checksum(&buf);
        buf.extend_from_slice(&sum);
        Ok(buf)
    }

    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        Self::encode(self.sequence, &self.ssid, &self.passphrase)
    }

    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        if data.len() < 1 + 4 + 1 + 1 + CHECKSUM_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "credential frame too short"));
        }
        if data[0] != FRAME_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported credential frame version {}", data[0]),
            ));
        }

        let (body, sum) = data.split_at(data.len() - CHECKSUM_LEN);
        if checksum(body) != sum {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "credential frame checksum mismatch"));
        }

        let sequence = u32::from_be_bytes([body[1], body[2], body[3], body[4]]);
        let ssid_len = body[5] as usize;
        let ssid_end = 6 + ssid_len;
        if body.len() < ssid_end + 1 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "credential frame SSID truncated"));
        }
        let ssid = body[6..ssid_end].to_vec();

        let pass_len = body[ssid_end] as usize;
        let pass_start = ssid_end + 1;
        if body.len() != pass_start + pass_len {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "credential frame passphrase truncated"));
        }
        let passphrase = body[pass_start..].to_vec();

        check_credential_lengths(&ssid, &passphrase)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        Ok(Self { sequence, ssid, passphrase })
    }
}

/// Split an encoded frame into writes of at most `max_payload` bytes
///
/// Each chunk is `header | data` where the header carries the chunk index
/// and the final-chunk bit.
pub fn chunk_frame(frame: &[u8], max_payload: usize) -> io::Result<Vec<Vec<u8>>> {
    if max_payload < 2 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "max payload must be at least 2 bytes"));
    }
    let data_len = max_payload - 1;
    let count = frame.len().div_ceil(data_len).max(1);
    if count > CHUNK_INDEX_MASK as usize + 1 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "credential frame needs too many chunks"));
    }

    let mut chunks = Vec::with_capacity(count);
    for (index, data) in frame.chunks(data_len).enumerate() {
        let mut header = index as u8;
        if index + 1 == count {
            header |= CHUNK_FINAL;
        }
        let mut chunk = Vec::with_capacity(1 + data.len());
        chunk.push(header);
        chunk.extend_from_slice(data);
        chunks.push(chunk);
    }
    Ok(chunks)
}

/// Peripheral-side reassembly of chunked frames
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    buf: Vec<u8>,
    next_index: u8,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk. Returns the complete frame after the final chunk.
    ///
    /// A chunk with index 0 always starts a new frame, so an interrupted
    /// transfer is discarded when the host retries.
    pub fn push(&mut self, chunk: &[u8]) -> io::Result<Option<Vec<u8>>> {
        let Some((&header, data)) = chunk.split_first() else {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "empty chunk"));
        };
        let index = header & CHUNK_INDEX_MASK;

        if index == 0 {
            self.reset();
        } else if index != self.next_index {
            self.reset();
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("out of order chunk {index}"),
            ));
        }

        self.buf.extend_from_slice(data);
        self.next_index = index.wrapping_add(1);

        if header & CHUNK_FINAL != 0 {
            self.next_index = 0;
            return Ok(Some(std::mem::take(&mut self.buf)));
        }
        Ok(None)
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.next_index = 0;
    }
}

/// Acknowledgement verdict from the peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    Ok,
    BadCredentials,
    Unsupported,
}

impl AckCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            ACK_OK => Some(Self::Ok),
            ACK_BAD_CREDENTIALS => Some(Self::BadCredentials),
            ACK_UNSUPPORTED => Some(Self::Unsupported),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Ok => ACK_OK,
            Self::BadCredentials => ACK_BAD_CREDENTIALS,
            Self::Unsupported => ACK_UNSUPPORTED,
        }
    }
}

/// Status notification: `code:u8 | sequence:u32`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub code: AckCode,
    pub sequence: u32,
}

impl Ack {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5);
        buf.push(self.code.as_u8());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        if data.len() < 5 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "ACK too short"));
        }
        let code = AckCode::from_u8(data[0]).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, format!("unknown ACK code 0x{:02x}", data[0]))
        })?;
        let sequence = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        Ok(Self { code, sequence })
    }
}
