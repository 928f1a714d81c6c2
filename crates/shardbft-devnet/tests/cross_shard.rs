use shardbft_consensus::{ConsensusConfig, EngineError};
use shardbft_core::{ChainLayer, CrossShardBlock, PendingBlock};
use shardbft_devnet::{Devnet, DevnetOptions};
use std::sync::Arc;

const SHARDS: usize = 2;

fn devnet() -> Devnet {
    let _ = env_logger::builder().is_test(true).try_init();
    let options = DevnetOptions {
        validators_per_committee: 4,
        transactions_per_block: 4,
    };
    let config = ConsensusConfig {
        shard_count: SHARDS,
        ..ConsensusConfig::default()
    };
    Devnet::new(options, config).unwrap()
}

async fn finalize(devnet: &Devnet, layer: ChainLayer) -> PendingBlock {
    let mut results = devnet.run_round(layer, 0).await.unwrap();
    results.remove(0).unwrap()
}

fn shard_block(block: PendingBlock) -> shardbft_core::ShardBlock {
    match block {
        PendingBlock::Shard(block) => block,
        PendingBlock::Beacon(_) => panic!("expected a shard block"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_finalized_outputs_reach_destination_pool() {
    let devnet = devnet();
    let source = shard_block(finalize(&devnet, ChainLayer::Shard(0)).await);

    let pending = devnet.cross_shard_pool().lock().pending_for_shard(1);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].hash().unwrap(), source.hash().unwrap());
    // transactions 1 and 3 of the sample block pay shard 1
    assert_eq!(pending[0].output_coins.len(), 2);
    assert!(devnet.cross_shard_pool().lock().pending_for_shard(0).is_empty());
    assert_eq!(devnet.network().stats().cross_shard_sent, 1);
}

#[tokio::test(start_paused = true)]
async fn test_destination_consumes_pooled_block() {
    let devnet = devnet();
    let source = shard_block(finalize(&devnet, ChainLayer::Shard(0)).await);
    let consumer = shard_block(finalize(&devnet, ChainLayer::Shard(1)).await);

    assert_eq!(consumer.body.cross_shard_inputs.len(), 1);
    let input = &consumer.body.cross_shard_inputs[0];
    assert_eq!(input.hash().unwrap(), source.hash().unwrap());
    assert!(devnet.chain().is_consumed(&source.hash().unwrap()));
    assert!(devnet.cross_shard_pool().lock().pending_for_shard(1).is_empty());

    // the next shard-1 block must not spend it again
    let next = shard_block(finalize(&devnet, ChainLayer::Shard(1)).await);
    assert!(next.body.cross_shard_inputs.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_tampered_block_is_rerequested_from_source() {
    let devnet = devnet();
    devnet.network().set_cross_shard_link(false);
    let source = shard_block(finalize(&devnet, ChainLayer::Shard(0)).await);
    devnet.network().set_cross_shard_link(true);
    assert!(devnet.cross_shard_pool().lock().is_empty());

    let mut tampered = CrossShardBlock::from_finalized(&source, 1, SHARDS).unwrap();
    tampered.output_coins[0].value += 1_000;
    let receiver = devnet.engines(ChainLayer::Shard(1))[0].clone();
    let rejected = receiver.receive_cross_shard(tampered);
    assert!(matches!(rejected, Err(EngineError::CrossShard { from_shard: 0, .. })));

    let stats = devnet.network().stats();
    assert_eq!(stats.cross_shard_requests, 1);
    let pending = devnet.cross_shard_pool().lock().pending_for_shard(1);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0], CrossShardBlock::from_finalized(&source, 1, SHARDS).unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_beacon_records_finalized_shard_tips() {
    let devnet = devnet();
    let source = shard_block(finalize(&devnet, ChainLayer::Shard(1)).await);

    let PendingBlock::Beacon(beacon) = finalize(&devnet, ChainLayer::Beacon).await else {
        panic!("expected a beacon block");
    };
    assert_eq!(beacon.body.shard_states.len(), 1);
    let state = &beacon.body.shard_states[0];
    assert_eq!((state.shard_id, state.height), (1, 1));
    assert_eq!(state.block_hash, source.hash().unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_all_layers_advance_together() {
    let devnet = Arc::new(devnet());
    let reports = devnet.run(2).await.unwrap();

    let layers: Vec<ChainLayer> = reports.iter().map(|r| r.layer).collect();
    assert_eq!(layers, vec![ChainLayer::Beacon, ChainLayer::Shard(0), ChainLayer::Shard(1)]);
    for report in &reports {
        assert!(report.height >= 2);
        assert_eq!(devnet.chain().tip(report.layer), (report.height, report.tip));
    }
}
