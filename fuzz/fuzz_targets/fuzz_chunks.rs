#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use wearable_link::config::TransferConfig;
use wearable_link::core::frame::Channel;
use wearable_link::protocol::chunking::Transfers;

fuzz_target!(|data: &[u8]| {
    // Feed length-prefixed chunk payloads into one endpoint; nothing may panic
    let Ok(mut transfers) = Transfers::new(64, TransferConfig::default()) else {
        return;
    };
    let mut rest = data;
    while let Some((&len, tail)) = rest.split_first() {
        let take = usize::from(len).min(tail.len());
        let (payload, next) = tail.split_at(take);
        let _ = transfers.on_chunk_frame(Channel::Bulk, &Bytes::copy_from_slice(payload));
        rest = next;
    }
    let _ = transfers.on_inbound_timeout(Channel::Bulk);
    let _ = transfers.on_outbound_timeout(Channel::Bulk);
});
