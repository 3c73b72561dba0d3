//! Integrity codec: MD5, CRC-32, additive checksums and the internet
//! checksum used at stripe level.
//!
//! The CRC-32 is the reflected 0xEDB88320 polynomial with 0xFFFFFFFF
//! initial value and final XOR. The 32-bit additive checksum comes in two
//! variants; SysV is the default and the wire format of legacy pipelines
//! depends on it, so the default must never change.

use anyhow::{Context, Result};
use md5::{Digest, Md5};
use tokio::io::AsyncReadExt;

/// Read buffer for file scans.
const BUF_SIZE: usize = 262144;

/// Additive checksum variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SumVariant {
    Bsd,
    #[default]
    SysV,
}

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 {
                0xEDB88320 ^ (c >> 1)
            } else {
                c >> 1
            };
            k += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
}

static CRC_TAB: [u32; 256] = crc32_table();

/// CRC-32 of an in-memory buffer.
pub fn mem_crc32(buf: &[u8]) -> u32 {
    let mut crc = 0xFFFFFFFFu32;
    for &b in buf {
        crc = (crc >> 8) ^ CRC_TAB[((crc ^ b as u32) & 0xFF) as usize];
    }
    crc ^ 0xFFFFFFFF
}

/// Additive checksum of an in-memory buffer.
///
/// BSD rotates a 16-bit accumulator right before each add; SysV sums all
/// bytes into 64 bits and folds 64 -> 32 -> 16.
pub fn mem_checksum(buf: &[u8], variant: SumVariant) -> u32 {
    match variant {
        SumVariant::Bsd => {
            let mut s = 0u32;
            for &b in buf {
                s = (s >> 1) + ((s & 1) << 15);
                s += b as u32;
                s &= 0xFFFF;
            }
            s
        }
        SumVariant::SysV => {
            let s: u64 = buf.iter().map(|&b| b as u64).sum();
            fold_sysv(s)
        }
    }
}

fn fold_sysv(s: u64) -> u32 {
    let s = (s & 0xFFFFFFFF) + (s >> 32);
    let r = (s & 0xFFFF) + ((s & 0xFFFFFFFF) >> 16);
    ((r & 0xFFFF) + (r >> 16)) as u32
}

/// MD5 of an in-memory buffer as 32-char lowercase hex.
pub fn mem_md5(buf: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(buf);
    hex::encode(hasher.finalize())
}

/// Combined CRC-32 and SysV checksum of a buffer in a single scan.
pub fn mem_crc_checksum(buf: &[u8]) -> (u32, u32) {
    let mut crc = 0xFFFFFFFFu32;
    let mut sum = 0u64;
    for &b in buf {
        crc = (crc >> 8) ^ CRC_TAB[((crc ^ b as u32) & 0xFF) as usize];
        sum += b as u64;
    }
    (fold_sysv(sum), crc ^ 0xFFFFFFFF)
}

/// One's-complement internet checksum over 16-bit words; the last odd
/// byte is padded high. Returns the complemented sum.
pub fn inet_checksum16(buf: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = buf.chunks_exact(2);
    for w in &mut chunks {
        sum += u32::from(u16::from_be_bytes([w[0], w[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// 32-bit variant of the internet checksum, summing 32-bit words with
/// carry folding. Used for whole-stripe verification.
pub fn inet_checksum32(buf: &[u8]) -> u32 {
    let mut sum = 0u64;
    let mut chunks = buf.chunks_exact(4);
    for w in &mut chunks {
        sum += u64::from(u32::from_be_bytes([w[0], w[1], w[2], w[3]]));
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut w = [0u8; 4];
        w[..rem.len()].copy_from_slice(rem);
        sum += u64::from(u32::from_be_bytes(w));
    }
    while sum >> 32 != 0 {
        sum = (sum & 0xFFFFFFFF) + (sum >> 32);
    }
    !(sum as u32)
}

/// Incremental 32-bit internet checksum for streamed stripe data.
#[derive(Debug, Default)]
pub struct InetSum32 {
    sum: u64,
    pending: Vec<u8>,
}

impl InetSum32 {
    pub fn update(&mut self, data: &[u8]) {
        // carry over a partial word from the previous block
        let mut buf;
        let data = if self.pending.is_empty() {
            data
        } else {
            buf = std::mem::take(&mut self.pending);
            buf.extend_from_slice(data);
            &buf[..]
        };
        let mut chunks = data.chunks_exact(4);
        for w in &mut chunks {
            self.sum += u64::from(u32::from_be_bytes([w[0], w[1], w[2], w[3]]));
        }
        self.pending = chunks.remainder().to_vec();
    }

    pub fn finish(mut self) -> u32 {
        if !self.pending.is_empty() {
            let mut w = [0u8; 4];
            w[..self.pending.len()].copy_from_slice(&self.pending);
            self.sum += u64::from(u32::from_be_bytes(w));
        }
        let mut sum = self.sum;
        while sum >> 32 != 0 {
            sum = (sum & 0xFFFFFFFF) + (sum >> 32);
        }
        !(sum as u32)
    }
}

/// MD5 of a file as 32-char lowercase hex.
pub async fn file_md5(path: &std::path::Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open {path:?} for checksum"))?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// CRC-32 of a file.
pub async fn file_crc32(path: &std::path::Path) -> Result<u32> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open {path:?} for checksum"))?;
    let mut crc = 0xFFFFFFFFu32;
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        for &b in &buf[..n] {
            crc = (crc >> 8) ^ CRC_TAB[((crc ^ b as u32) & 0xFF) as usize];
        }
    }
    Ok(crc ^ 0xFFFFFFFF)
}

/// Additive checksum of a file.
pub async fn file_checksum(path: &std::path::Path, variant: SumVariant) -> Result<u32> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open {path:?} for checksum"))?;
    let mut buf = vec![0u8; BUF_SIZE];
    let mut bsd = 0u32;
    let mut sysv = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        match variant {
            SumVariant::Bsd => {
                for &b in &buf[..n] {
                    bsd = (bsd >> 1) + ((bsd & 1) << 15);
                    bsd += b as u32;
                    bsd &= 0xFFFF;
                }
            }
            SumVariant::SysV => sysv += buf[..n].iter().map(|&b| b as u64).sum::<u64>(),
        }
    }
    Ok(match variant {
        SumVariant::Bsd => bsd,
        SumVariant::SysV => fold_sysv(sysv),
    })
}

/// Combined CRC-32 and SysV checksum of a file in one scan. Large files
/// are validated on every hop, so the single pass matters.
pub async fn file_crc_checksum(path: &std::path::Path) -> Result<(u32, u32)> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open {path:?} for checksum"))?;
    let mut crc = 0xFFFFFFFFu32;
    let mut sum = 0u64;
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        for &b in &buf[..n] {
            crc = (crc >> 8) ^ CRC_TAB[((crc ^ b as u32) & 0xFF) as usize];
            sum += b as u64;
        }
    }
    Ok((fold_sysv(sum), crc ^ 0xFFFFFFFF))
}

/// Integrity mismatch reported by [`validate_file`].
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("CRC failed for '{path}', {expected} != {actual}")]
    Crc {
        path: String,
        expected: u32,
        actual: u32,
    },
    #[error("SUM32 failed for '{path}', {expected} != {actual}")]
    Sum32 {
        path: String,
        expected: u32,
        actual: u32,
    },
    #[error("MD5 failed for '{path}', {expected} != {actual}")]
    Md5 {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("cannot read '{path}': {source}")]
    Io {
        path: String,
        source: anyhow::Error,
    },
}

/// Validate a file against any non-zero expected values.
///
/// Passes only when every supplied value matches; a zero sum/CRC or empty
/// MD5 means "not recorded" and is skipped. When both a CRC and a SUM32
/// are expected they are computed in a single scan.
pub async fn validate_file(
    path: &std::path::Path,
    sum32: u32,
    crc32: u32,
    md5: &str,
) -> std::result::Result<(), IntegrityError> {
    let pstr = path.display().to_string();
    if crc32 > 0 && sum32 > 0 {
        let (f_sum, f_crc) = file_crc_checksum(path)
            .await
            .map_err(|e| IntegrityError::Io {
                path: pstr.clone(),
                source: e,
            })?;
        if crc32 != f_crc {
            tracing::error!("Error: CRC failed for '{}', {} != {}", pstr, crc32, f_crc);
            return Err(IntegrityError::Crc {
                path: pstr,
                expected: crc32,
                actual: f_crc,
            });
        }
        if sum32 != f_sum {
            tracing::error!("Error: SUM32 failed for '{}', {} != {}", pstr, sum32, f_sum);
            return Err(IntegrityError::Sum32 {
                path: pstr,
                expected: sum32,
                actual: f_sum,
            });
        }
    } else {
        if crc32 > 0 {
            let f_crc = file_crc32(path)
                .await
                .map_err(|e| IntegrityError::Io {
                    path: pstr.clone(),
                    source: e,
                })?;
            if crc32 != f_crc {
                tracing::error!("Error: CRC failed for '{}', {} != {}", pstr, crc32, f_crc);
                return Err(IntegrityError::Crc {
                    path: pstr,
                    expected: crc32,
                    actual: f_crc,
                });
            }
        }
        if sum32 > 0 {
            let f_sum = file_checksum(path, SumVariant::default())
                .await
                .map_err(|e| IntegrityError::Io {
                    path: pstr.clone(),
                    source: e,
                })?;
            if sum32 != f_sum {
                tracing::error!("Error: SUM32 failed for '{}', {} != {}", pstr, sum32, f_sum);
                return Err(IntegrityError::Sum32 {
                    path: pstr,
                    expected: sum32,
                    actual: f_sum,
                });
            }
        }
    }
    if !md5.is_empty() {
        let f_md5 = file_md5(path).await.map_err(|e| IntegrityError::Io {
            path: pstr.clone(),
            source: e,
        })?;
        if md5 != f_md5 {
            tracing::error!("Error: MD5 failed for '{}', {} != {}", pstr, md5, f_md5);
            return Err(IntegrityError::Md5 {
                path: pstr,
                expected: md5.to_string(),
                actual: f_md5,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_vector() {
        assert_eq!(mem_crc32(b"123456789"), 0xCBF43926);
        assert_eq!(mem_crc32(b""), 0);
    }

    #[test]
    fn md5_known_vector() {
        assert_eq!(mem_md5(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn bsd_sum_rotates() {
        // hand-computed: rotate right within 16 bits, then add
        assert_eq!(mem_checksum(b"abc", SumVariant::Bsd), 16556);
    }

    #[test]
    fn sysv_sum_folds() {
        assert_eq!(mem_checksum(b"abc", SumVariant::SysV), 294);
        // force the 16-bit fold
        let buf = [0xFFu8; 1 << 16];
        let s: u64 = buf.iter().map(|&b| b as u64).sum();
        let expect = {
            let r = (s & 0xFFFF) + ((s & 0xFFFFFFFF) >> 16);
            ((r & 0xFFFF) + (r >> 16)) as u32
        };
        assert_eq!(mem_checksum(&buf, SumVariant::SysV), expect);
    }

    #[test]
    fn one_pass_matches_two_pass() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let (sum, crc) = mem_crc_checksum(&data);
        assert_eq!(sum, mem_checksum(&data, SumVariant::SysV));
        assert_eq!(crc, mem_crc32(&data));
    }

    #[test]
    fn inet16_verifies_to_all_ones() {
        let data = b"an even-length stripe of data!!!";
        assert_eq!(data.len() % 2, 0);
        let ck = inet_checksum16(data);
        let mut with_ck = data.to_vec();
        with_ck.extend_from_slice(&ck.to_be_bytes());
        // one's-complement sum over data + checksum folds to 0xFFFF,
        // so the complemented checksum of the whole is zero
        assert_eq!(inet_checksum16(&with_ck), 0);
    }

    #[test]
    fn inet32_incremental_matches_oneshot() {
        let data: Vec<u8> = (0..9973u32).map(|i| (i * 7 % 256) as u8).collect();
        let mut inc = InetSum32::default();
        for chunk in data.chunks(117) {
            inc.update(chunk);
        }
        assert_eq!(inc.finish(), inet_checksum32(&data));
    }

    #[tokio::test]
    async fn file_functions_match_memory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("payload.bin");
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 241) as u8).collect();
        tokio::fs::write(&path, &data).await?;
        assert_eq!(file_md5(&path).await?, mem_md5(&data));
        assert_eq!(file_crc32(&path).await?, mem_crc32(&data));
        assert_eq!(
            file_checksum(&path, SumVariant::SysV).await?,
            mem_checksum(&data, SumVariant::SysV)
        );
        assert_eq!(
            file_checksum(&path, SumVariant::Bsd).await?,
            mem_checksum(&data, SumVariant::Bsd)
        );
        let (sum, crc) = file_crc_checksum(&path).await?;
        assert_eq!((sum, crc), mem_crc_checksum(&data));
        Ok(())
    }

    #[tokio::test]
    async fn validate_checks_only_nonzero_values() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("v.bin");
        tokio::fs::write(&path, b"validate me").await?;
        let md5 = mem_md5(b"validate me");
        let (sum, crc) = mem_crc_checksum(b"validate me");
        validate_file(&path, sum, crc, &md5).await.unwrap();
        validate_file(&path, 0, 0, "").await.unwrap();
        validate_file(&path, 0, crc, "").await.unwrap();
        assert!(validate_file(&path, sum + 1, crc, &md5).await.is_err());
        assert!(validate_file(&path, 0, 0, "00112233445566778899aabbccddeeff")
            .await
            .is_err());
        Ok(())
    }
}
