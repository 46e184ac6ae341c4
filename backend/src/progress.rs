use tokio::sync::mpsc;

const STEP_PERCENT: u8 = 10;
const CHANNEL_CAPACITY: usize = (100 / STEP_PERCENT as usize) + 1;

/// Fetch-side half of the progress channel. Reports are collapsed to 10-point
/// steps and only forwarded when the step advances.
#[derive(Debug)]
pub struct ProgressSender {
    tx: mpsc::Sender<u8>,
    last_step: u8,
}

pub fn channel() -> (ProgressSender, mpsc::Receiver<u8>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    (ProgressSender { tx, last_step: 0 }, rx)
}

impl ProgressSender {
    pub fn report(&mut self, percent: f32) {
        if !percent.is_finite() {
            return;
        }

        let clamped = percent.clamp(0.0, 100.0) as u8;
        let step = clamped - clamped % STEP_PERCENT;
        if step <= self.last_step {
            return;
        }

        self.last_step = step;
        // a full channel means the consumer is behind; the next step supersedes this one
        let _ = self.tx.try_send(step);
    }
}
