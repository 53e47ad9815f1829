//! Revert payload decoding and wallet error classification.

use alloy_primitives::{hex, U256};
use ledger_gateway::{ProviderError, ProviderErrorCode};

const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

pub const EXECUTION_FAILED: &str =
    "execution failed; you may have hit the hourly contribution limit, try again later";

/// Decodes a revert payload into a human readable reason.
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    if data.len() < 4 {
        return None;
    }
    let (selector, body) = data.split_at(4);
    match selector {
        s if s == ERROR_STRING_SELECTOR => decode_error_string(body),
        s if s == PANIC_SELECTOR => {
            let code = read_word(body, 0)?;
            Some(describe_panic(code))
        }
        _ => Some(format!(
            "execution reverted with custom error 0x{}",
            hex::encode(selector)
        )),
    }
}

/// Reason text for a mined-but-reverted transaction.
pub fn failure_reason(revert_data: Option<&[u8]>) -> String {
    revert_data
        .and_then(decode_revert_reason)
        .unwrap_or_else(|| EXECUTION_FAILED.to_string())
}

fn read_word(body: &[u8], at: usize) -> Option<U256> {
    let end = at.checked_add(32)?;
    body.get(at..end).map(U256::from_be_slice)
}

fn decode_error_string(body: &[u8]) -> Option<String> {
    let offset = read_word(body, 0)?.saturating_to::<usize>();
    let len = read_word(body, offset)?.saturating_to::<usize>();
    let start = offset.checked_add(32)?;
    let bytes = body.get(start..start.checked_add(len)?)?;
    let reason = String::from_utf8(bytes.to_vec()).ok()?;
    let reason = reason.trim();
    (!reason.is_empty()).then(|| reason.to_string())
}

fn describe_panic(code: U256) -> String {
    let what = match code.saturating_to::<u64>() {
        0x01 => "assertion failed",
        0x11 => "arithmetic overflow",
        0x12 => "division by zero",
        0x32 => "array index out of bounds",
        0x41 => "out of memory",
        _ => "panic",
    };
    format!("{what} (panic code {code:#x})")
}

/// Whether `err` means the signer declined the request.
///
/// Structured provider codes are authoritative; message text is only
/// consulted when no code is attached.
pub fn is_user_decline(err: &anyhow::Error) -> bool {
    if let Some(provider) = find_provider_error(err) {
        if let Some(code) = provider.code {
            return code.is_user_rejection();
        }
    }
    err.chain().any(|cause| message_indicates_decline(&cause.to_string()))
}

/// Revert payload carried by a provider error, if any.
pub fn revert_payload(err: &anyhow::Error) -> Option<&[u8]> {
    find_provider_error(err)
        .and_then(|provider| provider.data.as_ref())
        .map(|data| &data[..])
}

/// A pre-broadcast call exception (e.g. gas estimation hit a revert).
pub fn is_call_exception(err: &anyhow::Error) -> bool {
    find_provider_error(err)
        .is_some_and(|provider| provider.code == Some(ProviderErrorCode::CallException))
}

fn find_provider_error(err: &anyhow::Error) -> Option<&ProviderError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ProviderError>())
}

fn message_indicates_decline(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("user rejected") || lower.contains("user denied")
}

#[cfg(test)]
#[path = "tests/revert_tests.rs"]
mod tests;
