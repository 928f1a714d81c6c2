use shardbft_core::{
    Committee, ConsensusArtifacts, CrossShardBlock, CrossShardError, CrossShardPool, OutputCoin, ShardBlock,
    ShardBody, Transaction,
};
use shardbft_crypto::{CommittedSig, Hash, MultiSigError, MultiSigScheme, ValidatorKeypair};
use std::collections::BTreeMap;
use std::sync::Arc;

const SHARDS: usize = 4;

fn committee_keys(first_seed: u8, n: u8) -> (Vec<Arc<ValidatorKeypair>>, Committee) {
    let keypairs: Vec<Arc<ValidatorKeypair>> = (first_seed..first_seed + n)
        .map(|seed| Arc::new(ValidatorKeypair::from_seed([seed; 32]).unwrap()))
        .collect();
    let committee = Committee::new(keypairs.iter().map(|k| k.public().clone()).collect()).unwrap();
    (keypairs, committee)
}

fn coin(last: u8, value: u64) -> OutputCoin {
    OutputCoin {
        public_key: vec![0x03, 0x42, last],
        value,
        serial: Hash::digest(&[last, value as u8]),
    }
}

fn source_block(producer: &ValidatorKeypair) -> ShardBlock {
    let body = ShardBody {
        transactions: vec![Transaction {
            inputs: vec![Hash::digest(b"spent")],
            outputs: vec![coin(1, 100), coin(5, 7), coin(2, 9), coin(4, 3)],
            fee: 2,
        }],
        cross_shard_inputs: vec![],
    };
    ShardBlock::new(0, 12, Hash::digest(b"parent"), producer.public().clone(), 1_700_000_000, 3, body, SHARDS).unwrap()
}

/// Runs both multisig rounds among every member and attaches the result.
fn finalize(block: &mut ShardBlock, keypairs: &[Arc<ValidatorKeypair>], committee: &Committee) {
    let digest = block.hash().unwrap();
    let mut schemes: Vec<MultiSigScheme> = keypairs
        .iter()
        .map(|k| MultiSigScheme::new(k.clone(), committee.members().to_vec()))
        .collect();

    let mut collected = BTreeMap::new();
    for (keypair, scheme) in keypairs.iter().zip(schemes.iter_mut()) {
        collected.insert(keypair.public().clone(), scheme.prepare());
        scheme.set_data_to_sign(digest);
    }
    let sigs: Vec<CommittedSig> = keypairs
        .iter()
        .zip(schemes.iter_mut())
        .map(|(keypair, scheme)| {
            let combined = scheme.sign_data(&collected).unwrap();
            CommittedSig {
                signer: keypair.public().clone(),
                signature: combined.commit_sig.clone(),
                validators_idx_r: combined.validators_idx_r.clone(),
            }
        })
        .collect();

    let combined = schemes[0].combined().unwrap().clone();
    let aggregation = schemes[0].combine_sigs(&combined.r, &sigs).unwrap();
    block.consensus = Some(ConsensusArtifacts {
        r: combined.r,
        aggregated_sig: aggregation.signature,
        validators_idx_r: combined.validators_idx_r,
        validators_idx_sig: aggregation.validators_idx_sig,
    });
}

fn finalized_cross_block(to_shard: u8) -> (CrossShardBlock, Committee) {
    let (keypairs, committee) = committee_keys(10, 4);
    let mut block = source_block(&keypairs[0]);
    finalize(&mut block, &keypairs, &committee);
    (CrossShardBlock::from_finalized(&block, to_shard, SHARDS).unwrap(), committee)
}

#[test]
fn test_valid_cross_shard_block_accepted() {
    let (cross, committee) = finalized_cross_block(1);
    assert_eq!(cross.output_coins, vec![coin(1, 100), coin(5, 7)]);
    assert_eq!(cross.merkle_path.len(), 2);
    cross.verify(&committee, SHARDS).unwrap();
}

#[test]
fn test_empty_batch_still_verifies() {
    let (cross, committee) = finalized_cross_block(3);
    assert!(cross.output_coins.is_empty());
    cross.verify(&committee, SHARDS).unwrap();
}

#[test]
fn test_valid_path_with_bad_signature_rejected() {
    let (mut cross, committee) = finalized_cross_block(1);
    cross.consensus.aggregated_sig.s[31] ^= 0x01;
    assert!(cross.verify_merkle_path(SHARDS).is_ok());
    assert!(matches!(
        cross.verify(&committee, SHARDS),
        Err(CrossShardError::Signature(_))
    ));
}

#[test]
fn test_valid_signature_from_wrong_committee_rejected() {
    let (cross, _) = finalized_cross_block(1);
    let (_, other_committee) = committee_keys(40, 4);
    assert!(cross.verify(&other_committee, SHARDS).is_err());
}

#[test]
fn test_valid_signature_with_bad_path_rejected() {
    let (mut cross, committee) = finalized_cross_block(1);
    cross.output_coins[0].value += 1;
    assert!(cross.verify_signature(&committee).is_ok());
    assert_eq!(cross.verify(&committee, SHARDS), Err(CrossShardError::RootMismatch));

    let (mut truncated, committee) = finalized_cross_block(2);
    truncated.merkle_path.pop();
    assert!(matches!(
        truncated.verify(&committee, SHARDS),
        Err(CrossShardError::PathLength { .. })
    ));
}

#[test]
fn test_minority_signature_rejected() {
    let (keypairs, committee) = committee_keys(10, 4);
    let mut block = source_block(&keypairs[0]);
    // only two of four members sign; the aggregate is sound but not a majority
    let (signers, _) = keypairs.split_at(2);
    finalize(&mut block, signers, &committee);
    let cross = CrossShardBlock::from_finalized(&block, 1, SHARDS).unwrap();
    assert_eq!(
        cross.verify(&committee, SHARDS),
        Err(CrossShardError::Signature(MultiSigError::InsufficientSigners {
            signers: 2,
            committee_size: 4
        }))
    );
}

#[test]
fn test_unfinalized_or_self_addressed_blocks_not_extracted() {
    let (keypairs, committee) = committee_keys(10, 4);
    let mut block = source_block(&keypairs[0]);
    assert_eq!(
        CrossShardBlock::from_finalized(&block, 1, SHARDS).unwrap_err(),
        CrossShardError::NotFinalized
    );
    finalize(&mut block, &keypairs, &committee);
    assert_eq!(
        CrossShardBlock::from_finalized(&block, 0, SHARDS).unwrap_err(),
        CrossShardError::SameShard(0)
    );
}

#[test]
fn test_pool_dedupes_and_drains_consumed() {
    let (cross, committee) = finalized_cross_block(1);
    let mut pool = CrossShardPool::new(SHARDS).unwrap();
    assert!(pool.insert(cross.clone(), &committee).unwrap());
    assert!(!pool.insert(cross.clone(), &committee).unwrap());
    assert_eq!(pool.pending_for_shard(1), vec![cross.clone()]);
    assert!(pool.pending_for_shard(2).is_empty());

    pool.remove_consumed(1, &[cross.hash().unwrap()]);
    assert!(pool.is_empty());
}

#[test]
fn test_pool_rejects_invalid_block() {
    let (mut cross, committee) = finalized_cross_block(2);
    cross.output_coins.push(coin(2, 1));
    let mut pool = CrossShardPool::new(SHARDS).unwrap();
    assert!(pool.insert(cross, &committee).is_err());
    assert_eq!(pool.len(), 0);
}
