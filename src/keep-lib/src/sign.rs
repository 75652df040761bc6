use crate::{KeepError, KeepResult, Locator};
use hmac::{Hmac, Mac};
use md5::Md5;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacMd5 = Hmac<Md5>;

/// Signing tokens longer than this are truncated before entering the MAC.
const TOKEN_SIGNATURE_BYTES: usize = 10;

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn signature_hex(hash: &str, token: &str, expiry: u64, key: &[u8]) -> String {
    let mut mac = HmacMd5::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(hash.as_bytes());
    let token = token.as_bytes();
    mac.update(&token[..token.len().min(TOKEN_SIGNATURE_BYTES)]);
    mac.update(format!("{:x}", expiry).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Sign a locator with a `+A<hmac>@<hex-expiry>` hint. Existing `+A` and
/// `+R` hints are dropped; other hints are preserved.
pub fn sign_locator(locator: &str, token: &str, expiry: u64, key: &[u8]) -> KeepResult<String> {
    let mut loc = Locator::parse(locator)?.without_signatures();
    let sig = signature_hex(loc.hash(), token, expiry, key);
    loc.push_hint(format!("A{}@{:x}", sig, expiry));
    Ok(loc.to_string())
}

/// Check a locator's `+A` signature. Succeeds iff the hint is present, its
/// HMAC matches, and the expiry is in the future.
pub fn verify_signature(locator: &str, token: &str, key: &[u8]) -> KeepResult<()> {
    let loc = Locator::parse(locator)?;
    let hint = loc
        .hints()
        .iter()
        .rev()
        .find(|h| h.starts_with('A'))
        .ok_or_else(|| KeepError::SignatureExpired(format!("no +A hint in {}", locator)))?;
    let (sig, ts) = hint[1..]
        .split_once('@')
        .ok_or_else(|| KeepError::SignatureExpired(format!("malformed +A hint in {}", locator)))?;
    let expiry = u64::from_str_radix(ts, 16)
        .map_err(|_| KeepError::SignatureExpired(format!("malformed expiry in {}", locator)))?;
    if signature_hex(loc.hash(), token, expiry, key) != sig {
        return Err(KeepError::SignatureExpired(format!(
            "signature mismatch on {}",
            locator
        )));
    }
    if expiry <= unix_now() {
        return Err(KeepError::SignatureExpired(format!(
            "signature expired at {:x}: {}",
            expiry, locator
        )));
    }
    Ok(())
}

/// Expiry time of the last `+A` hint, or None for an unsigned locator.
pub fn signature_expiry_time(locator: &str) -> KeepResult<Option<SystemTime>> {
    let loc = Locator::parse(locator)?;
    Ok(loc.expiry().map(|e| UNIX_EPOCH + Duration::from_secs(e)))
}

/// Re-sign every locator in a manifest with a fresh expiry. Fileseg tokens
/// and stream names pass through untouched.
pub fn sign_manifest(manifest: &str, token: &str, expiry: u64, key: &[u8]) -> KeepResult<String> {
    let mut out = String::with_capacity(manifest.len());
    for line in manifest.split_inclusive('\n') {
        let (line, newline) = match line.strip_suffix('\n') {
            Some(rest) => (rest, "\n"),
            None => (line, ""),
        };
        for (i, tok) in line.split(' ').enumerate() {
            if i > 0 {
                out.push(' ');
            }
            if i > 0 && Locator::parse(tok).is_ok() {
                out.push_str(&sign_locator(tok, token, expiry, key)?);
            } else {
                out.push_str(tok);
            }
        }
        out.push_str(newline);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"zfhgfenhffzltr9dixws36j1yhksjoll2grmku38mi7yxd66h5j4q9w4jzanezacp8s6q0ro3hxakfye02152hncy6zml2ed0uc";
    const TOKEN: &str = "v2/zzzzz-gj3su-077z32aux8dg2s1/8kr6sn1ivds2mm7hh34a0gcrn8vvbj1jamwiq009jyjrgp75fb";

    #[test]
    fn test_sign_and_verify() {
        let expiry = unix_now() + 300;
        let signed = sign_locator("acbd18db4cc2f85cedef654fccc4a4d8+3", TOKEN, expiry, KEY).unwrap();
        assert!(signed.starts_with("acbd18db4cc2f85cedef654fccc4a4d8+3+A"));
        verify_signature(&signed, TOKEN, KEY).unwrap();

        assert!(verify_signature(&signed, "some other token", KEY).is_err());
        assert!(verify_signature(&signed, TOKEN, b"wrong key").is_err());
    }

    #[test]
    fn test_verify_expired() {
        let signed = sign_locator(
            "acbd18db4cc2f85cedef654fccc4a4d8+3",
            TOKEN,
            unix_now() - 2,
            KEY,
        )
        .unwrap();
        match verify_signature(&signed, TOKEN, KEY) {
            Err(KeepError::SignatureExpired(_)) => {}
            other => panic!("expected SignatureExpired, got {:?}", other),
        }
    }

    #[test]
    fn test_verify_unsigned() {
        assert!(verify_signature("acbd18db4cc2f85cedef654fccc4a4d8+3", TOKEN, KEY).is_err());
    }

    #[test]
    fn test_sign_replaces_old_signature() {
        let expiry = unix_now() + 300;
        let signed = sign_locator(
            "acbd18db4cc2f85cedef654fccc4a4d8+3+A0123456789abcdef0123456789abcdef@00000001+Zfoo",
            TOKEN,
            expiry,
            KEY,
        )
        .unwrap();
        verify_signature(&signed, TOKEN, KEY).unwrap();
        assert!(signed.contains("+Zfoo"));
        assert!(!signed.contains("@00000001"));
    }

    #[test]
    fn test_sign_manifest() {
        let expiry = unix_now() + 300;
        let m = ". acbd18db4cc2f85cedef654fccc4a4d8+3+Rzzzzz-xyzzy@11111111 0:3:foo\n./dir 37b51d194a7513e45b56f6524f2d51f2+3 0:3:bar\n";
        let signed = sign_manifest(m, TOKEN, expiry, KEY).unwrap();
        assert!(!signed.contains("+R"));
        for line in signed.lines() {
            let loc = line.split(' ').nth(1).unwrap();
            verify_signature(loc, TOKEN, KEY).unwrap();
        }
        assert!(signed.ends_with("0:3:bar\n"));
    }

    #[test]
    fn test_expiry_time() {
        let t = signature_expiry_time("acbd18db4cc2f85cedef654fccc4a4d8+3+A12345678@00000064")
            .unwrap()
            .unwrap();
        assert_eq!(t, UNIX_EPOCH + Duration::from_secs(100));
        assert_eq!(
            signature_expiry_time("acbd18db4cc2f85cedef654fccc4a4d8+3").unwrap(),
            None
        );
    }
}
