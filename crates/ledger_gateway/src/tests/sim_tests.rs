use super::*;
use alloy_primitives::address;
use shared::units::{tokens, TOKEN_DECIMALS};

use crate::{ProviderErrorCode, USER_REJECTED_CODE};

const LEDGER: Address = address!("1aec70c1bcb65a0cde00ff1a6c5d348761363d99");
const TOKEN: Address = address!("58eb07f482c3d4c524c25d0a5bd22f44adb7396d");
const OWNER: Address = address!("00000000000000000000000000000000000000a1");

fn us() -> BucketId {
    "US".parse().expect("bucket id")
}

fn one_token() -> U256 {
    tokens(1, TOKEN_DECIMALS)
}

#[test]
fn error_string_encoding_matches_abi_layout() {
    let encoded = encode_error_string("rate limit");
    assert_eq!(&encoded[..4], &ERROR_STRING_SELECTOR);
    assert_eq!(encoded.len(), 4 + 32 + 32 + 32);
    assert_eq!(U256::from_be_slice(&encoded[36..68]), U256::from(10u64));
    assert_eq!(&encoded[68..78], b"rate limit");
}

#[tokio::test]
async fn contribution_moves_tokens_into_bucket() {
    let ledger = SimulatedLedger::new(LEDGER, TOKEN);
    ledger.mint(OWNER, tokens(3, TOKEN_DECIMALS)).await;
    let signer = ledger.signer(OWNER);

    let approval = signer.approve(LEDGER, one_token()).await.expect("approve");
    assert!(approval.wait().await.expect("mined").succeeded());
    assert_eq!(
        ledger.allowance(OWNER, LEDGER).await.expect("allowance"),
        one_token()
    );

    let pending = signer
        .contribute(&us(), one_token(), TxOverrides::default())
        .await
        .expect("contribute");
    let receipt = pending.wait().await.expect("mined");
    assert!(receipt.succeeded());
    assert_eq!(receipt.logs.len(), 1);
    assert_eq!(ledger.read(&us()).await.expect("read"), one_token());
    assert_eq!(ledger.balance_of(OWNER).await, tokens(2, TOKEN_DECIMALS));
    assert_eq!(
        ledger.allowance(OWNER, LEDGER).await.expect("allowance"),
        U256::ZERO
    );
}

#[tokio::test]
async fn second_contribution_inside_window_reverts_with_rate_limit() {
    let ledger = SimulatedLedger::new(LEDGER, TOKEN);
    ledger.mint(OWNER, tokens(5, TOKEN_DECIMALS)).await;
    ledger
        .set_allowance(OWNER, LEDGER, tokens(5, TOKEN_DECIMALS))
        .await;
    let signer = ledger.signer(OWNER);

    let first = signer
        .contribute(&us(), one_token(), TxOverrides::default())
        .await
        .expect("first")
        .wait()
        .await
        .expect("mined");
    assert!(first.succeeded());

    let second = signer
        .contribute(&us(), one_token(), TxOverrides::default())
        .await
        .expect("second")
        .wait()
        .await
        .expect("mined");
    assert_eq!(second.status, 0);
    assert_eq!(
        second.revert_data,
        Some(encode_error_string(RATE_LIMIT_REASON))
    );
    assert_eq!(ledger.read(&us()).await.expect("read"), one_token());

    ledger.reset_throttle().await;
    let third = signer
        .contribute(&us(), one_token(), TxOverrides::default())
        .await
        .expect("third")
        .wait()
        .await
        .expect("mined");
    assert!(third.succeeded());
}

#[tokio::test]
async fn contribution_without_allowance_reverts() {
    let ledger = SimulatedLedger::new(LEDGER, TOKEN);
    ledger.mint(OWNER, one_token()).await;
    let receipt = ledger
        .signer(OWNER)
        .contribute(&us(), one_token(), TxOverrides::default())
        .await
        .expect("broadcast")
        .wait()
        .await
        .expect("mined");
    assert_eq!(
        receipt.revert_data,
        Some(encode_error_string(INSUFFICIENT_ALLOWANCE_REASON))
    );
}

#[tokio::test]
async fn low_gas_limit_reverts_without_payload() {
    let ledger = SimulatedLedger::new(LEDGER, TOKEN);
    ledger.mint(OWNER, one_token()).await;
    ledger.set_allowance(OWNER, LEDGER, one_token()).await;
    let receipt = ledger
        .signer(OWNER)
        .contribute(
            &us(),
            one_token(),
            TxOverrides {
                gas_limit: Some(21_000),
            },
        )
        .await
        .expect("broadcast")
        .wait()
        .await
        .expect("mined");
    assert_eq!(receipt.status, 0);
    assert!(receipt.revert_data.is_none());
}

#[tokio::test]
async fn declined_signature_surfaces_structured_code() {
    let ledger = SimulatedLedger::new(LEDGER, TOKEN);
    ledger.decline_approvals(true).await;
    let err = match ledger.signer(OWNER).approve(LEDGER, one_token()).await {
        Ok(_) => panic!("approval should be declined"),
        Err(err) => err,
    };
    let provider = err.downcast_ref::<ProviderError>().expect("provider error");
    assert_eq!(
        provider.code,
        Some(ProviderErrorCode::Rpc(USER_REJECTED_CODE))
    );
    assert_eq!(ledger.approve_calls(), 1);
}

#[tokio::test]
async fn failing_read_is_scoped_to_one_bucket() {
    let ledger = SimulatedLedger::new(LEDGER, TOKEN);
    let cn: BucketId = "CN".parse().expect("bucket id");
    ledger.set_total(&us(), one_token()).await;
    ledger.fail_reads_for(&cn, true).await;

    assert!(ledger.read(&cn).await.is_err());
    assert_eq!(ledger.read(&us()).await.expect("read"), one_token());
    assert_eq!(ledger.read_calls(), 2);
}
