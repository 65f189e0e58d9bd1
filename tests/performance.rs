use ndtape::performance::{
    Chord, ChordProgression, EVENT_SIZE, Event, FC_WEIGHTS, GenerationConfig, MAX_SHIFT_INDEX, PerformanceRnn,
    Quality, RecordingSink, SHIFT_OFFSET, SinkCall, StepOutcome, VELOCITY_BINS, lstm_kernel_name, random_checkpoint,
    status_message, velocity_fraction,
};
use ndtape::{Error, NDArray};

fn config(seed: u64) -> GenerationConfig {
    GenerationConfig {
        steps_per_generate_call: 6,
        seed: Some(seed),
        ..Default::default()
    }
}

fn generated(outcome: StepOutcome) -> (Vec<Event>, Vec<usize>) {
    match outcome {
        StepOutcome::Generated { events, samples } => (events, samples),
        StepOutcome::Cancelled => panic!("step was cancelled"),
    }
}

#[test]
fn test_event_table_boundaries() {
    assert_eq!(EVENT_SIZE, 364);
    assert_eq!(Event::decode(0).unwrap(), Event::NoteOn { pitch: 0 });
    assert_eq!(Event::decode(127).unwrap(), Event::NoteOn { pitch: 127 });
    assert_eq!(Event::decode(128).unwrap(), Event::NoteOff { pitch: 0 });
    assert_eq!(Event::decode(SHIFT_OFFSET).unwrap(), Event::TimeShift { steps: 1 });
    assert_eq!(Event::decode(MAX_SHIFT_INDEX).unwrap(), Event::TimeShift { steps: 100 });
    assert_eq!(Event::decode(356).unwrap(), Event::VelocityChange { bin: 1 });
    assert_eq!(Event::decode(363).unwrap(), Event::VelocityChange { bin: 8 });
    assert!(matches!(Event::decode(364), Err(Error::UndecodableIndex(364))));
}

#[test]
fn test_every_index_round_trips() {
    for index in 0..EVENT_SIZE {
        assert_eq!(Event::decode(index).unwrap().index().unwrap(), index);
    }
}

#[test]
fn test_chord_names() {
    let progression = ChordProgression::parse(&["C", "Dm", "Eb", "F#m", "Bb", "G", "Am", "N.C."]).unwrap();
    assert_eq!(progression.at(1), Chord::Triad { root: 2, quality: Quality::Minor });
    assert_eq!(progression.at(8), progression.at(0));
    assert_eq!(progression.indices()[7], 0.0);
    assert!(matches!(
        ChordProgression::parse(&["C", "C", "C", "C", "F", "F", "G", "E#"]),
        Err(Error::UnknownChord(_))
    ));
    assert!(ChordProgression::parse(&["C", "F"]).is_err());
}

#[test]
fn test_missing_variable_reported() {
    let mut vars = random_checkpoint(&[8, 8], 0.1, 1).unwrap();
    vars.remove(&lstm_kernel_name(1));
    let err = PerformanceRnn::open(&vars, GenerationConfig { lstm_layers: 2, ..config(1) }).unwrap_err();
    assert_eq!(err, Error::MissingVariable(lstm_kernel_name(1)));
    assert!(status_message(&err).contains("cell_1"));
}

#[test]
fn test_misshaped_variable_reported() {
    let mut vars = random_checkpoint(&[8], 0.1, 1).unwrap();
    vars.insert(FC_WEIGHTS, NDArray::zeros(vec![8, 10]));
    let err = PerformanceRnn::open(&vars, config(1)).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
}

#[test]
fn test_invalid_config_rejected() {
    let vars = random_checkpoint(&[8], 0.1, 1).unwrap();
    let bad = GenerationConfig {
        steps_per_generate_call: 0,
        ..config(1)
    };
    assert!(matches!(PerformanceRnn::open(&vars, bad), Err(Error::InvalidConfig(_))));
}

#[test]
fn test_seeded_generation_is_reproducible() {
    let vars = random_checkpoint(&[16, 8], 0.2, 5).unwrap();
    let cfg = GenerationConfig { lstm_layers: 2, ..config(21) };
    let run = || {
        let mut rnn = PerformanceRnn::open(&vars, cfg.clone()).unwrap();
        let mut sink = RecordingSink::default();
        let token = rnn.current_token();
        let (_, first) = generated(pollster::block_on(rnn.generate_step(token, &mut sink)).unwrap());
        let (_, second) = generated(pollster::block_on(rnn.generate_step(token, &mut sink)).unwrap());
        (first, second, sink.calls)
    };
    let (a1, a2, calls_a) = run();
    let (b1, b2, calls_b) = run();
    assert_eq!(a1, b1);
    assert_eq!(a2, b2);
    assert_eq!(calls_a, calls_b);
    assert!(a1.iter().chain(&a2).all(|&i| i < EVENT_SIZE));
}

#[test]
fn test_cancelled_token_plays_nothing() {
    let vars = random_checkpoint(&[8], 0.2, 2).unwrap();
    let mut rnn = PerformanceRnn::open(&vars, config(4)).unwrap();
    let token = rnn.current_token();
    let before = rnn.context().step().data_sync().unwrap();
    let live = rnn.math().live_arrays();

    rnn.canceller().cancel();
    let mut sink = RecordingSink::default();
    let outcome = pollster::block_on(rnn.generate_step(token, &mut sink)).unwrap();

    assert_eq!(outcome, StepOutcome::Cancelled);
    assert!(sink.calls.is_empty());
    assert_eq!(rnn.context().step().data_sync().unwrap(), before);
    assert_eq!(rnn.math().live_arrays(), live);
}

#[test]
fn test_chord_change_restarts_generation() {
    let vars = random_checkpoint(&[8], 0.2, 2).unwrap();
    let mut rnn = PerformanceRnn::open(&vars, config(4)).unwrap();
    let old = rnn.current_token();
    let mut sink = RecordingSink::default();
    generated(pollster::block_on(rnn.generate_step(old, &mut sink)).unwrap());

    let progression = ChordProgression::parse(&["Am", "Am", "F", "F", "C", "C", "G", "G"]).unwrap();
    let fresh = rnn.set_chord_progression(progression, 10.0).unwrap();
    assert_ne!(old, fresh);
    assert_eq!(rnn.context().step().get_scalar().unwrap(), 0.0);
    assert_eq!(rnn.context().performer().time(), 10.0);

    let mut after = RecordingSink::default();
    let outcome = pollster::block_on(rnn.generate_step(old, &mut after)).unwrap();
    assert_eq!(outcome, StepOutcome::Cancelled);
    assert!(after.calls.is_empty());
    generated(pollster::block_on(rnn.generate_step(fresh, &mut after)).unwrap());
}

#[test]
fn test_steps_do_not_leak_arrays() {
    let vars = random_checkpoint(&[8], 0.2, 2).unwrap();
    let mut rnn = PerformanceRnn::open(&vars, config(9)).unwrap();
    let token = rnn.current_token();
    let mut sink = RecordingSink::default();
    generated(pollster::block_on(rnn.generate_step(token, &mut sink)).unwrap());
    let live = rnn.math().live_arrays();
    for _ in 0..5 {
        generated(pollster::block_on(rnn.generate_step(token, &mut sink)).unwrap());
    }
    assert_eq!(rnn.math().live_arrays(), live);
    // the top velocity bin lands just above full velocity
    let loudest = velocity_fraction(VELOCITY_BINS);
    assert!(sink.calls.iter().all(|call| match call {
        SinkCall::NoteOn(pitch, velocity) => *pitch <= 127 && (0.0..=loudest).contains(velocity),
        SinkCall::NoteOff(pitch) => *pitch <= 127,
        SinkCall::TimeShift(seconds) => *seconds > 0.0 && *seconds <= 1.0,
        SinkCall::VelocityChange(velocity) => (0.0..=loudest).contains(velocity),
    }));
}

#[test]
fn test_schedule_delay_resets_on_lag() {
    let vars = random_checkpoint(&[8], 0.2, 2).unwrap();
    let mut rnn = PerformanceRnn::open(&vars, config(9)).unwrap();
    rnn.reset(0.0).unwrap();
    let delay = rnn.schedule_delay(5.0);
    assert!(delay.is_zero());
    assert_eq!(rnn.context().performer().time(), 5.0);
}
