use shardbft_consensus::{CommitteeProvider, ConsensusConfig, ConsensusMessage, EngineError, MessageBody, MessageKind, RoundError};
use shardbft_core::{ChainLayer, PendingBlock};
use shardbft_crypto::{MultiSigError, NonceCommitment, ValidatorKey};
use shardbft_devnet::{drop_from, drop_kind, Devnet, DevnetError, DevnetOptions};
use std::sync::Arc;
use std::time::Duration;

const SHARD: ChainLayer = ChainLayer::Shard(0);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn devnet(validators: usize) -> Devnet {
    init_logging();
    let options = DevnetOptions {
        validators_per_committee: validators,
        transactions_per_block: 4,
    };
    let config = ConsensusConfig {
        shard_count: 1,
        ..ConsensusConfig::default()
    };
    Devnet::new(options, config).unwrap()
}

fn round_error(result: &Result<PendingBlock, EngineError>) -> &RoundError {
    match result {
        Err(EngineError::Round { source, .. }) => source,
        other => panic!("expected a round failure, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_single_validator_finalizes_alone() {
    let devnet = devnet(1);
    let results = devnet.run_round(SHARD, 0).await.unwrap();

    let block = results[0].as_ref().unwrap();
    assert_eq!(block.height(), 1);
    assert_eq!(block.consensus().unwrap().validators_idx_sig, vec![0]);
    assert_eq!(devnet.chain().tip(SHARD).0, 1);
}

#[tokio::test(start_paused = true)]
async fn test_honest_committee_agrees_on_one_block() {
    let devnet = devnet(4);
    let results = devnet.run_round(SHARD, 0).await.unwrap();

    let blocks: Vec<&PendingBlock> = results.iter().map(|r| r.as_ref().unwrap()).collect();
    let hash = blocks[0].hash().unwrap();
    assert!(blocks.iter().all(|b| b.hash().unwrap() == hash));

    // height 1, attempt 0: member (1 + 0) % 4 proposes
    let proposer = devnet.engines(SHARD)[1].keypair().public();
    assert_eq!(blocks[0].producer(), proposer);

    let committee = devnet.chain().committee(SHARD, 1).unwrap();
    assert!(blocks[0].is_final(&committee));
    assert_eq!(blocks[0].consensus().unwrap().validators_idx_sig, vec![0, 1, 2, 3]);
    assert_eq!(devnet.chain().tip(SHARD), (1, hash));
}

#[tokio::test(start_paused = true)]
async fn test_attempt_rotates_proposer() {
    let devnet = devnet(4);
    let results = devnet.run_round(SHARD, 2).await.unwrap();

    let proposer = devnet.engines(SHARD)[3].keypair().public();
    for result in &results {
        assert_eq!(result.as_ref().unwrap().producer(), proposer);
    }
}

#[tokio::test(start_paused = true)]
async fn test_missing_ready_fails_both_roles() {
    let devnet = devnet(4);
    devnet.network().set_interceptor(drop_kind(MessageKind::Ready));
    let results = devnet.run_round(SHARD, 0).await.unwrap();

    assert_eq!(
        round_error(&results[1]),
        &RoundError::NotEnoughReady {
            received: 0,
            required: 1
        }
    );
    for index in [0, 2, 3] {
        assert_eq!(round_error(&results[index]), &RoundError::ListenTimeout);
    }
    assert_eq!(devnet.chain().tip(SHARD).0, 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_nonces_fail_prepare() {
    let devnet = devnet(4);
    devnet.network().set_interceptor(drop_kind(MessageKind::Prepare));
    let results = devnet.run_round(SHARD, 0).await.unwrap();

    for result in &results {
        assert_eq!(
            round_error(result),
            &RoundError::NotEnoughRi {
                collected: 1,
                required: 2
            }
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_two_commits_of_four_cannot_combine() {
    let devnet = devnet(4);
    let silent: Vec<_> = devnet.engines(SHARD)[2..]
        .iter()
        .map(|engine| engine.keypair().public().clone())
        .collect();
    devnet
        .network()
        .set_interceptor(drop_from(silent, vec![MessageKind::Commit]));
    let results = devnet.run_round(SHARD, 0).await.unwrap();

    for result in &results {
        assert_eq!(round_error(result), &RoundError::NotEnoughSigs);
    }
    assert_eq!(devnet.chain().tip(SHARD).0, 0);
}

#[tokio::test(start_paused = true)]
async fn test_three_of_four_finalize_without_silent_member() {
    let devnet = devnet(4);
    let results = devnet.run_round_with(SHARD, 0, &[0, 1, 2]).await.unwrap();

    for result in &results {
        let block = result.as_ref().unwrap();
        let artifacts = block.consensus().unwrap();
        assert_eq!(artifacts.validators_idx_r, vec![0, 1, 2]);
        assert_eq!(artifacts.validators_idx_sig, vec![0, 1, 2]);
    }
    assert_eq!(devnet.chain().tip(SHARD).0, 1);
}

#[tokio::test(start_paused = true)]
async fn test_majority_finalizes_when_contributor_withholds_commit() {
    let devnet = devnet(4);
    let withholding = devnet.engines(SHARD)[3].keypair().public().clone();
    devnet
        .network()
        .set_interceptor(drop_from(vec![withholding], vec![MessageKind::Commit]));
    let results = devnet.run_round(SHARD, 0).await.unwrap();

    let committee = devnet.chain().committee(SHARD, 1).unwrap();
    let hash = results[0].as_ref().unwrap().hash().unwrap();
    for (index, result) in results.iter().enumerate() {
        let block = result.as_ref().unwrap();
        assert_eq!(block.hash().unwrap(), hash);
        assert!(block.is_final(&committee));

        let artifacts = block.consensus().unwrap();
        assert_eq!(artifacts.validators_idx_r, vec![0, 1, 2, 3]);
        let expected_signers = if index == 3 { vec![0, 1, 2, 3] } else { vec![0, 1, 2] };
        assert_eq!(artifacts.validators_idx_sig, expected_signers);
    }
    assert_eq!(devnet.chain().tip(SHARD), (1, hash));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_nonce_and_commit_ignored_by_sender() {
    let devnet = devnet(4);
    let member = devnet.engines(SHARD)[3].keypair().clone();
    let member_key = member.public().clone();
    let other_point = NonceCommitment::from_bytes(devnet.engines(SHARD)[0].keypair().public().as_bytes()).unwrap();
    devnet.network().set_interceptor(Arc::new(move |message: &ConsensusMessage, _: &ValidatorKey| {
        if message.sender != member_key {
            return vec![message.clone()];
        }
        let mut body = message.body.clone();
        match &mut body {
            MessageBody::Prepare { ri, .. } => *ri = other_point.clone(),
            MessageBody::Commit { partial_sig, .. } => partial_sig.s[31] ^= 0x01,
            _ => return vec![message.clone()],
        }
        let second = ConsensusMessage::new_signed(message.layer, message.height, body, &member).unwrap();
        vec![message.clone(), second]
    }));
    let results = devnet.run_round(SHARD, 0).await.unwrap();

    let first = results[0].as_ref().unwrap().consensus().unwrap().clone();
    for result in &results {
        let artifacts = result.as_ref().unwrap().consensus().unwrap();
        assert_eq!(artifacts.r, first.r);
        assert_eq!(artifacts.validators_idx_sig, vec![0, 1, 2, 3]);
        assert_eq!(artifacts.aggregated_sig.nonce, artifacts.r);
    }
}

#[tokio::test(start_paused = true)]
async fn test_badly_signed_messages_dropped_round_continues() {
    let devnet = devnet(4);
    let member = devnet.engines(SHARD)[3].keypair().clone();
    let member_key = member.public().clone();
    devnet.network().set_interceptor(Arc::new(move |message: &ConsensusMessage, _: &ValidatorKey| {
        let mut message = message.clone();
        if message.sender == member_key && matches!(message.kind(), MessageKind::Ready | MessageKind::Prepare) {
            message.signature = member.sign(b"some other payload");
        }
        vec![message]
    }));
    let results = devnet.run_round(SHARD, 0).await.unwrap();

    let committee = devnet.chain().committee(SHARD, 1).unwrap();
    for (index, result) in results.iter().enumerate() {
        let block = result.as_ref().unwrap();
        assert!(block.is_final(&committee));
        let artifacts = block.consensus().unwrap();
        // member 3's Prepare was dropped everywhere, so every block carries the R of members 0..2
        assert_eq!(artifacts.validators_idx_r, vec![0, 1, 2], "member {}", index);
        assert_eq!(artifacts.validators_idx_sig, vec![0, 1, 2], "member {}", index);
    }
    assert_eq!(devnet.chain().tip(SHARD).0, 1);
}

#[tokio::test(start_paused = true)]
async fn test_forged_partial_signature_aborts_round() {
    let devnet = devnet(4);
    let byzantine = devnet.engines(SHARD)[3].keypair().clone();
    let byzantine_key = byzantine.public().clone();
    devnet.network().set_interceptor(Arc::new(move |message: &ConsensusMessage, _: &ValidatorKey| {
        if message.sender != byzantine_key {
            return vec![message.clone()];
        }
        let mut body = message.body.clone();
        if let MessageBody::Commit { partial_sig, .. } = &mut body {
            partial_sig.s[31] ^= 0x01;
        }
        vec![ConsensusMessage::new_signed(message.layer, message.height, body, &byzantine).unwrap()]
    }));
    let results = devnet.run_round(SHARD, 0).await.unwrap();

    for index in 0..3 {
        match round_error(&results[index]) {
            RoundError::InvalidPartialSignature { signer, source } => {
                assert_eq!(signer, &devnet.engines(SHARD)[3].keypair().public().to_string());
                assert!(matches!(source, MultiSigError::InvalidPartialSignature(_)));
            }
            other => panic!("expected an invalid partial signature, got {:?}", other),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_layer_runs_consecutive_heights() {
    let devnet = devnet(4);
    let report = devnet.run_layer(SHARD, 3).await.unwrap();

    assert_eq!(report.height, 3);
    let members = devnet.engines(SHARD);
    for height in 1..=3u64 {
        let block = devnet.chain().block_at(SHARD, height).unwrap();
        let expected = members[(height % 4) as usize].keypair().public();
        assert_eq!(block.producer(), expected);
        if height > 1 {
            let parent = devnet.chain().block_at(SHARD, height - 1).unwrap();
            assert_eq!(block.prev_block_hash(), parent.hash().unwrap());
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_running_layer() {
    let devnet = Arc::new(devnet(4));
    let running = {
        let devnet = devnet.clone();
        tokio::spawn(async move { devnet.run_layer(SHARD, 50).await })
    };

    tokio::time::sleep(Duration::from_secs(3)).await;
    devnet.shutdown();

    let outcome = running.await.unwrap();
    assert!(matches!(outcome, Err(DevnetError::Engine(EngineError::Shutdown))));
    assert!(devnet.chain().tip(SHARD).0 < 50);
}
