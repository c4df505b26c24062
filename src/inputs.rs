//! Operator input: rotary encoder and push button.
//!
//! The pin tasks run beside the control loop and only record what happened.
//! The control loop drains the recorded rotation and button press once per
//! tick with [`drain`].

use core::cell::Cell;

use critical_section::Mutex;
use embassy_futures::select::{select, Either};
use embassy_time::{Duration, Timer};
use embedded_hal::digital::InputPin;
use embedded_hal_async::digital::Wait;
use heapless::Vec;
use portable_atomic::{AtomicBool, Ordering};

use crate::log::*;

pub const BUTTON_DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InputEvent {
    /// Net encoder detents since the last drain, clockwise positive.
    Rotation(i32),
    ButtonPressed,
}

/// Step counter written from the encoder edge handler and consumed by the
/// control loop. Both sides go through a critical section so a read-and-clear
/// can never lose or double count a step.
pub struct EncoderCounter {
    steps: Mutex<Cell<i32>>,
}

impl EncoderCounter {
    pub const fn new() -> Self {
        Self {
            steps: Mutex::new(Cell::new(0)),
        }
    }

    pub fn record(&self, step: i32) {
        critical_section::with(|cs| {
            let steps = self.steps.borrow(cs);
            steps.set(steps.get().saturating_add(step));
        });
    }

    /// Edge on the CLK line. `clk`/`dt` are the levels sampled after the edge.
    pub fn on_clk_edge(&self, clk: bool, dt: bool) {
        self.record(if dt != clk { 1 } else { -1 });
    }

    /// Edge on the DT line.
    pub fn on_dt_edge(&self, clk: bool, dt: bool) {
        self.record(if clk == dt { 1 } else { -1 });
    }

    /// Read and clear the accumulated steps atomically.
    pub fn take(&self) -> i32 {
        critical_section::with(|cs| self.steps.borrow(cs).replace(0))
    }
}

impl Default for EncoderCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Press latch: set by the button task, cleared by whoever consumes it.
pub struct ButtonLatch {
    pressed: AtomicBool,
}

impl ButtonLatch {
    pub const fn new() -> Self {
        Self {
            pressed: AtomicBool::new(false),
        }
    }

    pub fn press(&self) {
        self.pressed.store(true, Ordering::Release);
    }

    pub fn take(&self) -> bool {
        self.pressed.swap(false, Ordering::AcqRel)
    }
}

impl Default for ButtonLatch {
    fn default() -> Self {
        Self::new()
    }
}

pub static ENCODER: EncoderCounter = EncoderCounter::new();
pub static BUTTON: ButtonLatch = ButtonLatch::new();

/// Collect whatever the input tasks recorded since the previous call.
pub fn drain() -> Vec<InputEvent, 2> {
    drain_from(&ENCODER, &BUTTON)
}

pub fn drain_from(encoder: &EncoderCounter, button: &ButtonLatch) -> Vec<InputEvent, 2> {
    let mut events = Vec::new();
    let steps = encoder.take();
    if steps != 0 {
        let _ = events.push(InputEvent::Rotation(steps));
    }
    if button.take() {
        let _ = events.push(InputEvent::ButtonPressed);
    }
    events
}

/// Wait for one edge on either encoder line and record the step it makes.
pub async fn next_encoder_edge<CLK, DT>(clk: &mut CLK, dt: &mut DT, counter: &EncoderCounter)
where
    CLK: InputPin + Wait,
    DT: InputPin + Wait,
{
    let (from_clk, waited) = match select(clk.wait_for_any_edge(), dt.wait_for_any_edge()).await {
        Either::First(result) => (true, result.is_ok()),
        Either::Second(result) => (false, result.is_ok()),
    };
    if !waited {
        warn!("encoder edge wait failed");
        return;
    }
    let (clk, dt) = match (clk.is_high(), dt.is_high()) {
        (Ok(clk), Ok(dt)) => (clk, dt),
        _ => {
            warn!("encoder pin read failed");
            return;
        }
    };
    if from_clk {
        counter.on_clk_edge(clk, dt);
    } else {
        counter.on_dt_edge(clk, dt);
    }
}

/// Wait for one press of an active-low button, latch it, then sit out the
/// bounce.
pub async fn next_button_press<B: Wait>(button: &mut B, latch: &ButtonLatch, debounce: Duration) {
    if button.wait_for_falling_edge().await.is_ok() {
        debug!("button pressed");
        latch.press();
    } else {
        warn!("button wait failed");
    }
    if debounce.as_ticks() > 0 {
        Timer::after(debounce).await;
    }
}

/// Decode a quadrature encoder wired to two interrupt-capable pins.
pub async fn watch_encoder<CLK, DT>(mut clk: CLK, mut dt: DT) -> !
where
    CLK: InputPin + Wait,
    DT: InputPin + Wait,
{
    loop {
        next_encoder_edge(&mut clk, &mut dt, &ENCODER).await;
    }
}

/// Active-low push button with a pull-up.
pub async fn watch_button<B: Wait>(mut button: B) -> ! {
    loop {
        next_button_press(&mut button, &BUTTON, BUTTON_DEBOUNCE).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use core::future::pending;
    use embassy_futures::block_on;

    /// Pin with a settable level. An armed edge completes the next wait that
    /// asks for it; otherwise the wait never returns.
    #[derive(Default)]
    struct MockPin {
        high: bool,
        rising: bool,
        falling: bool,
    }

    impl MockPin {
        fn edge_to(&mut self, high: bool) {
            self.high = high;
            self.rising = high;
            self.falling = !high;
        }

        async fn wait_until(&mut self, rising: bool, falling: bool) -> Result<(), Infallible> {
            if (rising && self.rising) || (falling && self.falling) {
                self.rising = false;
                self.falling = false;
                Ok(())
            } else {
                pending().await
            }
        }
    }

    impl embedded_hal::digital::ErrorType for MockPin {
        type Error = Infallible;
    }

    impl InputPin for MockPin {
        fn is_high(&mut self) -> Result<bool, Infallible> {
            Ok(self.high)
        }

        fn is_low(&mut self) -> Result<bool, Infallible> {
            Ok(!self.high)
        }
    }

    impl Wait for MockPin {
        async fn wait_for_high(&mut self) -> Result<(), Infallible> {
            if self.high {
                Ok(())
            } else {
                pending().await
            }
        }

        async fn wait_for_low(&mut self) -> Result<(), Infallible> {
            if self.high {
                pending().await
            } else {
                Ok(())
            }
        }

        async fn wait_for_rising_edge(&mut self) -> Result<(), Infallible> {
            self.wait_until(true, false).await
        }

        async fn wait_for_falling_edge(&mut self) -> Result<(), Infallible> {
            self.wait_until(false, true).await
        }

        async fn wait_for_any_edge(&mut self) -> Result<(), Infallible> {
            self.wait_until(true, true).await
        }
    }

    #[test]
    fn encoder_edges_are_counted_by_direction() {
        let counter = EncoderCounter::new();
        let mut clk = MockPin::default();
        let mut dt = MockPin::default();

        // Clockwise: CLK rises, then DT follows.
        clk.edge_to(true);
        block_on(next_encoder_edge(&mut clk, &mut dt, &counter));
        dt.edge_to(true);
        block_on(next_encoder_edge(&mut clk, &mut dt, &counter));
        assert_eq!(counter.take(), 2);

        // Counter-clockwise: DT falls first.
        dt.edge_to(false);
        block_on(next_encoder_edge(&mut clk, &mut dt, &counter));
        clk.edge_to(false);
        block_on(next_encoder_edge(&mut clk, &mut dt, &counter));
        assert_eq!(counter.take(), -2);
    }

    #[test]
    fn button_press_is_latched_on_the_falling_edge() {
        let latch = ButtonLatch::new();
        let mut button = MockPin::default();
        button.high = true;

        button.edge_to(false);
        block_on(next_button_press(&mut button, &latch, Duration::from_ticks(0)));
        assert!(latch.take());
        assert!(!latch.take());
    }

    #[test]
    fn take_clears_the_counter() {
        let counter = EncoderCounter::new();
        counter.record(1);
        counter.record(1);
        counter.record(-1);
        assert_eq!(counter.take(), 1);
        assert_eq!(counter.take(), 0);
    }

    #[test]
    fn quadrature_direction() {
        let counter = EncoderCounter::new();
        // Clockwise: CLK leads DT.
        counter.on_clk_edge(true, false);
        counter.on_dt_edge(true, true);
        counter.on_clk_edge(false, true);
        counter.on_dt_edge(false, false);
        assert_eq!(counter.take(), 4);

        // Counter-clockwise: DT leads CLK.
        counter.on_dt_edge(false, true);
        counter.on_clk_edge(true, true);
        counter.on_dt_edge(true, false);
        counter.on_clk_edge(false, false);
        assert_eq!(counter.take(), -4);
    }

    #[test]
    fn concurrent_steps_are_not_lost() {
        use std::sync::Arc;
        use std::thread;

        let counter = Arc::new(EncoderCounter::new());
        let writer = {
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..10_000 {
                    counter.record(1);
                }
            })
        };
        let mut total = 0;
        while !writer.is_finished() {
            total += counter.take();
        }
        writer.join().unwrap();
        total += counter.take();
        assert_eq!(total, 10_000);
    }

    #[test]
    fn button_latch_fires_once() {
        let button = ButtonLatch::new();
        assert!(!button.take());
        button.press();
        button.press();
        assert!(button.take());
        assert!(!button.take());
    }

    #[test]
    fn drain_reports_rotation_then_press() {
        let encoder = EncoderCounter::new();
        let button = ButtonLatch::new();
        assert!(drain_from(&encoder, &button).is_empty());

        encoder.record(-3);
        button.press();
        let events = drain_from(&encoder, &button);
        assert_eq!(
            events.as_slice(),
            &[InputEvent::Rotation(-3), InputEvent::ButtonPressed]
        );
        assert!(drain_from(&encoder, &button).is_empty());
    }
}
