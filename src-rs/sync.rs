use crate::beacon::{BlockId, BlockSource, Notification};
use crate::instructions::InstructionFile;
use crate::reconcile::Reconciler;
use crate::state::StateStore;
use crate::tag::{decode_graffiti, graffiti_text};
use rand::rngs::StdRng;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Replays missed blocks, then follows the chain head, keeping the graffiti
/// file current. Blocks are handled strictly one at a time.
pub struct SyncDriver<B: BlockSource, S: StateStore> {
    source: B,
    reconciler: Reconciler<S>,
    output: InstructionFile,
    rng: StdRng,
}

impl<B: BlockSource, S: StateStore> SyncDriver<B, S> {
    pub fn new(source: B, reconciler: Reconciler<S>, output: InstructionFile, rng: StdRng) -> Self {
        Self {
            source,
            reconciler,
            output,
            rng,
        }
    }

    #[cfg(test)]
    pub fn reconciler(&self) -> &Reconciler<S> {
        &self.reconciler
    }

    pub fn rebuild(&mut self) {
        let diff = self.reconciler.diff();
        if let Err(err) = self.output.rebuild(&diff, &mut self.rng) {
            error!("{err:#}");
        }
    }

    /// Writes the initial graffiti file and replays `[watermark, head)`.
    /// A fresh state (watermark 0) starts at head instead of replaying the chain.
    pub async fn start(&mut self) {
        let head = match self.source.head_slot().await {
            Ok(head) => {
                info!("Current slot on beacon chain: {head}");
                Some(head)
            }
            Err(err) => {
                warn!(error = %err, "could not resolve head slot, skipping catch-up");
                None
            }
        };

        self.rebuild();

        if let Some(head) = head {
            let watermark = self.reconciler.watermark();
            if watermark > 0 && watermark < head {
                self.catch_up(head).await;
            }
        }
    }

    pub async fn catch_up(&mut self, head: u64) {
        let from = self.reconciler.watermark();
        for slot in from..head {
            info!("syncing slot {slot} / {head}");
            self.sync_block(BlockId::Slot(slot)).await;
        }
    }

    /// Fetches, decodes and folds one block. A failed fetch leaves the wall and
    /// watermark untouched.
    pub async fn sync_block(&mut self, id: BlockId) {
        let block = match self.source.fetch_block(id).await {
            Ok(block) => block,
            Err(err) => {
                warn!(block = %id, error = %err, "abandoning block fetch");
                return;
            }
        };

        debug!(
            slot = block.slot,
            "graffiti: {}",
            graffiti_text(&block.graffiti).unwrap_or_default()
        );
        let update = decode_graffiti(&block.graffiti).map(|tag| tag.into_update());

        match self.reconciler.apply(block.slot, update.as_ref()) {
            Ok(true) => self.rebuild(),
            Ok(false) => {}
            Err(err) => error!(slot = block.slot, "{err:#}"),
        }
    }

    /// Head is resolved at fetch time; the slot carried by the event is
    /// only logged.
    pub async fn handle(&mut self, notification: Notification) {
        if let Notification::Block { slot: Some(slot) } = notification {
            debug!(slot, "block event");
        }
        self.sync_block(BlockId::Head).await;
    }

    pub async fn run(mut self, mut notifications: mpsc::Receiver<Notification>) {
        info!("start event listener");
        while let Some(notification) = notifications.recv().await {
            self.handle(notification).await;
        }
        info!("event listener closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::{BlockRecord, TransportError};
    use crate::canvas::{Position, TargetImage};
    use crate::state::{JsonStateFile, PersistentState};
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};
    use rand::SeedableRng;
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeChain {
        blocks: HashMap<u64, String>,
        head: Mutex<u64>,
        fetched: Mutex<Vec<BlockId>>,
    }

    impl FakeChain {
        fn with_block(mut self, slot: u64, graffiti: &str) -> Self {
            self.blocks
                .insert(slot, format!("0x{}", hex::encode(graffiti.as_bytes())));
            self
        }

        fn at_head(self, head: u64) -> Self {
            *self.head.lock().unwrap() = head;
            self
        }

        fn fetched(&self) -> Vec<BlockId> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl<'a> BlockSource for &'a FakeChain {
        async fn fetch_block(&self, id: BlockId) -> Result<BlockRecord, TransportError> {
            self.fetched.lock().unwrap().push(id);
            let slot = match id {
                BlockId::Head => *self.head.lock().unwrap(),
                BlockId::Slot(slot) => slot,
            };
            let graffiti = self
                .blocks
                .get(&slot)
                .ok_or_else(|| TransportError::Malformed(format!("no block at {slot}")))?;
            Ok(BlockRecord {
                slot,
                graffiti: graffiti.clone(),
            })
        }
    }

    fn target() -> TargetImage {
        let mut img = RgbImage::from_pixel(2, 2, Rgb([255, 255, 255]));
        img.put_pixel(0, 0, Rgb([0xaa, 0xbb, 0xcc]));
        TargetImage::from_rgb(&img, Position::new(5, 5)).unwrap()
    }

    fn seed_state(path: &Path, last_slot: u64) {
        let mut store = JsonStateFile::new(path);
        store
            .save(&PersistentState {
                last_slot,
                ..Default::default()
            })
            .unwrap();
    }

    fn make_driver<'a>(
        chain: &'a FakeChain,
        dir: &Path,
    ) -> SyncDriver<&'a FakeChain, JsonStateFile> {
        let reconciler =
            Reconciler::open(target(), JsonStateFile::new(dir.join("state.json"))).unwrap();
        let output = InstructionFile::new(dir.join("graffiti.txt"), "<gw>", None);
        SyncDriver::new(chain, reconciler, output, StdRng::seed_from_u64(3))
    }

    #[tokio::test]
    async fn start_writes_file_even_without_chain_access() {
        let dir = tempdir().unwrap();
        let chain = FakeChain::default();
        let mut driver = make_driver(&chain, dir.path());
        driver.start().await;
        assert_eq!(
            fs::read_to_string(dir.path().join("graffiti.txt")).unwrap(),
            "default: gw:005005aabbcc"
        );
    }

    #[tokio::test]
    async fn fresh_state_does_not_replay_history() {
        let dir = tempdir().unwrap();
        let chain = FakeChain::default().with_block(10, "teku").at_head(10);
        let mut driver = make_driver(&chain, dir.path());
        driver.start().await;
        assert_eq!(chain.fetched(), vec![BlockId::Head]);
        assert_eq!(driver.reconciler().watermark(), 0);
    }

    #[tokio::test]
    async fn catch_up_replays_in_order_so_later_writes_win() {
        let dir = tempdir().unwrap();
        seed_state(&dir.path().join("state.json"), 3);
        let chain = FakeChain::default()
            .with_block(3, "gw:005005000000")
            .with_block(4, "nothing to see")
            .with_block(6, "graffitiwall:5:5:#aabbcc")
            .with_block(7, "head block")
            .at_head(7);
        let mut driver = make_driver(&chain, dir.path());
        driver.start().await;

        assert_eq!(
            chain.fetched(),
            vec![
                BlockId::Head,
                BlockId::Slot(3),
                BlockId::Slot(4),
                BlockId::Slot(5),
                BlockId::Slot(6),
            ]
        );
        // Slot 5 was missing, which doesn't stop the replay.
        assert_eq!(driver.reconciler().watermark(), 6);
        assert_eq!(
            driver
                .reconciler()
                .wall()
                .get(Position::new(5, 5))
                .unwrap()
                .as_str(),
            "aabbcc"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("graffiti.txt")).unwrap(),
            "default: "
        );

        let reloaded = JsonStateFile::new(dir.path().join("state.json"))
            .load()
            .unwrap();
        assert_eq!(reloaded.last_slot, 6);
    }

    #[tokio::test]
    async fn live_notifications_fetch_head_and_rebuild() {
        let dir = tempdir().unwrap();
        let chain = FakeChain::default()
            .with_block(20, "gw:005005aabbcc")
            .at_head(20);
        let driver = make_driver(&chain, dir.path());

        let (tx, rx) = mpsc::channel(4);
        tx.send(Notification::Opened).await.unwrap();
        tx.send(Notification::Block { slot: Some(19) }).await.unwrap();
        drop(tx);
        driver.run(rx).await;

        assert_eq!(chain.fetched(), vec![BlockId::Head, BlockId::Head]);
        assert_eq!(
            fs::read_to_string(dir.path().join("graffiti.txt")).unwrap(),
            "default: "
        );
        let reloaded = JsonStateFile::new(dir.path().join("state.json"))
            .load()
            .unwrap();
        assert_eq!(reloaded.last_slot, 20);
    }

    #[tokio::test]
    async fn irrelevant_change_does_not_rebuild() {
        let dir = tempdir().unwrap();
        let chain = FakeChain::default()
            .with_block(30, "gw:100100000000")
            .at_head(30);
        let mut driver = make_driver(&chain, dir.path());
        driver.handle(Notification::Opened).await;

        assert!(!dir.path().join("graffiti.txt").exists());
        assert_eq!(driver.reconciler().watermark(), 30);
        assert_eq!(driver.reconciler().wall().len(), 1);
    }
}
