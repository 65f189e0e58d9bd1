use ndtape::math::{LstmCell, LstmState};
use ndtape::{DType, Error, Math, NDArray, array};
use proptest::prelude::*;

fn cell(inputs: usize, units: usize, offset: f32) -> LstmCell {
    let weights = (0..(inputs + units) * 4 * units)
        .map(|i| ((i as f32 * 0.37 + offset).sin()) * 0.3)
        .collect();
    LstmCell {
        kernel: NDArray::new(vec![inputs + units, 4 * units], weights).unwrap(),
        bias: NDArray::fill(vec![4 * units], 0.05),
        forget_bias: NDArray::scalar(1.0),
    }
}

#[test]
fn test_softmax_rows_sum_to_one() {
    let math = Math::cpu();
    let y = math.softmax(&array!([[1000.0, 1001.0, 999.0], [-3.0, 0.0, 3.0]])).unwrap();
    let rows = math.sum(&y, Some(1)).unwrap().data_sync().unwrap();
    for total in rows {
        assert!((total - 1.0).abs() < 1e-5);
    }
    assert!(y.data_sync().unwrap().iter().all(|v| v.is_finite()));
}

#[test]
fn test_multinomial_frequencies() {
    let math = Math::cpu().seeded(11);
    let probs = array!([0.1, 0.2, 0.7]);
    let n = 20_000;
    let draws = math.multinomial(&probs, n).unwrap();
    assert_eq!(draws.shape(), &[n]);
    assert_eq!(draws.dtype(), DType::I32);

    let mut counts = [0usize; 3];
    for d in draws.data_sync().unwrap() {
        counts[d as usize] += 1;
    }
    for (count, p) in counts.iter().zip([0.1, 0.2, 0.7]) {
        let freq = *count as f32 / n as f32;
        assert!((freq - p).abs() < 0.02, "frequency {freq} too far from {p}");
    }
}

#[test]
fn test_multinomial_renormalizes() {
    let math = Math::cpu().seeded(3);
    let draws = math.multinomial(&array!([[0.0, 5.0], [3.0, 0.0]]), 50).unwrap();
    assert_eq!(draws.shape(), &[2, 50]);
    let data = draws.data_sync().unwrap();
    assert!(data[..50].iter().all(|&d| d == 1.0));
    assert!(data[50..].iter().all(|&d| d == 0.0));
}

#[test]
fn test_multinomial_rejects_bad_weights() {
    let math = Math::cpu();
    assert!(matches!(
        math.multinomial(&array!([0.0, 0.0]), 1),
        Err(Error::InvalidDistribution(_))
    ));
    assert!(matches!(
        math.multinomial(&array!([0.5, -0.5, 1.0]), 1),
        Err(Error::InvalidDistribution(_))
    ));
}

#[test]
fn test_seeded_sampling_is_reproducible() {
    let probs = array!([0.25, 0.25, 0.25, 0.25]);
    let a = Math::cpu().seeded(99).multinomial(&probs, 64).unwrap();
    let b = Math::cpu().seeded(99).multinomial(&probs, 64).unwrap();
    assert_eq!(a.data_sync().unwrap(), b.data_sync().unwrap());
}

#[test]
fn test_one_hot_out_of_range() {
    let math = Math::cpu();
    assert!(matches!(
        math.one_hot(&array!([0.0, 4.0]), 4),
        Err(Error::IndexOutOfRange { index: 4, bound: 4 })
    ));
}

#[test]
fn test_lstm_zero_state_is_deterministic() {
    let math = Math::cpu();
    let cells = [cell(3, 4, 0.0), cell(4, 2, 1.0)];
    let data = array!([[0.5, -0.25, 1.0]]);
    let run = || {
        let state = LstmState::zeros(&math, &[4, 2]);
        let next = math.multi_rnn_cell(&cells, &data, &state).unwrap();
        next.h[1].data_sync().unwrap()
    };
    let first = run();
    assert_eq!(first.len(), 2);
    assert_eq!(first, run());
}

#[test]
fn test_multi_rnn_feeds_layers_forward() {
    let math = Math::cpu();
    let cells = [cell(2, 3, 0.0), cell(3, 3, 0.5)];
    let data = array!([[1.0, -1.0]]);
    let state = LstmState::zeros(&math, &[3, 3]);
    let next = math.multi_rnn_cell(&cells, &data, &state).unwrap();

    let (c0, h0) = cells[0].step(&math, &data, &state.c[0], &state.h[0]).unwrap();
    let (c1, h1) = cells[1].step(&math, &h0, &state.c[1], &state.h[1]).unwrap();
    assert_eq!(next.c[0].data_sync().unwrap(), c0.data_sync().unwrap());
    assert_eq!(next.c[1].data_sync().unwrap(), c1.data_sync().unwrap());
    assert_eq!(next.h[1].data_sync().unwrap(), h1.data_sync().unwrap());
    // |h| < 1 since h = tanh(c) · σ(o)
    assert!(next.h.iter().all(|h| h.data_sync().unwrap().iter().all(|v| v.abs() < 1.0)));
}

#[test]
fn test_lstm_rejects_bad_kernel() {
    let math = Math::cpu();
    let bad = LstmCell {
        kernel: NDArray::zeros(vec![3, 8]),
        bias: NDArray::zeros(vec![8]),
        forget_bias: NDArray::scalar(1.0),
    };
    let state = LstmState::zeros(&math, &[2]);
    assert!(matches!(
        math.multi_rnn_cell(&[bad], &array!([[1.0, 2.0]]), &state),
        Err(Error::ShapeMismatch { .. })
    ));
}

proptest! {
    #[test]
    fn prop_one_hot_arg_max_round_trip(indices in prop::collection::vec(0usize..64, 1..8), extra in 0usize..8) {
        let depth = indices.iter().copied().max().unwrap_or(0) + 1 + extra;
        let math = Math::cpu();
        let x = NDArray::new_1d(indices.iter().map(|&i| i as f32).collect());
        let encoded = math.one_hot(&x, depth).unwrap();
        prop_assert_eq!(encoded.shape(), &[indices.len(), depth]);
        let decoded = math.arg_max(&encoded).unwrap().data_sync().unwrap();
        let decoded: Vec<usize> = decoded.into_iter().map(|d| d as usize).collect();
        prop_assert_eq!(decoded, indices);
    }
}
