//! Drives a Performance-RNN for a few seconds and prints what it plays.
//!
//! Without a trained checkpoint the model is random, so the output is
//! noise; the point is the loop: generate, wait, repeat, and switch chords
//! half way through, which cancels the run in flight.
//!
//! ```text
//! cargo run --example performance_rnn
//! cargo run --example performance_rnn --features wgpu
//! ```

use ndtape::backend::BackendKind;
use ndtape::performance::{
    ChordProgression, GenerationConfig, PerformanceRnn, PlaybackSink, StepOutcome, random_checkpoint,
    status_message,
};
use std::time::{Duration, Instant};

// how long to play for
const RUN_SECONDS: f64 = 4.0;

struct PrintSink {
    clock: f64,
}

impl PlaybackSink for PrintSink {
    fn note_on(&mut self, pitch: u8, velocity: f32) {
        println!("{:7.2}s  on   {pitch:3}  vel {velocity:.2}", self.clock);
    }

    fn note_off(&mut self, pitch: u8) {
        println!("{:7.2}s  off  {pitch:3}", self.clock);
    }

    fn time_shift(&mut self, seconds: f64) {
        self.clock += seconds;
    }

    fn velocity_change(&mut self, velocity: f32) {
        println!("{:7.2}s  velocity {velocity:.2}", self.clock);
    }
}

fn main() {
    let backend = if cfg!(feature = "wgpu") {
        BackendKind::Wgpu
    } else {
        BackendKind::Cpu
    };
    let config = GenerationConfig {
        lstm_layers: 2,
        seed: Some(2017),
        backend,
        ..Default::default()
    };

    let vars = match random_checkpoint(&[64, 32], 0.15, 1) {
        Ok(vars) => vars,
        Err(e) => {
            eprintln!("{}", status_message(&e));
            return;
        }
    };
    let mut rnn = match PerformanceRnn::open(&vars, config) {
        Ok(rnn) => rnn,
        Err(e) => {
            eprintln!("{}", status_message(&e));
            return;
        }
    };

    let start = Instant::now();
    let now = || start.elapsed().as_secs_f64();
    let mut sink = PrintSink { clock: 0.0 };
    let mut token = match rnn.reset(now()) {
        Ok(token) => token,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };
    let mut switched = false;

    while now() < RUN_SECONDS {
        if !switched && now() > RUN_SECONDS / 2.0 {
            switched = true;
            let stale = token;
            let progression = ChordProgression::parse(&["Am", "Am", "G", "G", "F", "F", "E", "E"])
                .and_then(|p| rnn.set_chord_progression(p, now()));
            match progression {
                Ok(fresh) => token = fresh,
                Err(e) => {
                    eprintln!("{e}");
                    return;
                }
            }
            println!("-- chords changed to {} --", rnn.progression());
            // work still holding the old token is dropped
            let outcome = pollster::block_on(rnn.generate_step(stale, &mut sink));
            assert!(matches!(outcome, Ok(StepOutcome::Cancelled)));
            sink.clock = 0.0;
        }

        match pollster::block_on(rnn.generate_step(token, &mut sink)) {
            Ok(StepOutcome::Generated { samples, .. }) => {
                log::trace!("sampled {samples:?}");
            }
            Ok(StepOutcome::Cancelled) => continue,
            Err(e) => {
                eprintln!("generation stopped: {e}");
                return;
            }
        }
        std::thread::sleep(rnn.schedule_delay(now()).min(Duration::from_millis(250)));
    }

    println!("live arrays at exit: {}", rnn.math().live_arrays());
}
