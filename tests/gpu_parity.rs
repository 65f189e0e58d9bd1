//! The wgpu backend must agree with the CPU reference. Skipped when no
//! adapter is available.
#![cfg(feature = "wgpu")]

use ndtape::backend::{BackendKind, MatrixOrientation};
use ndtape::conv_util::Padding;
use ndtape::math::{LstmCell, LstmState};
use ndtape::{Error, Math, NDArray, Result};

const TOL: f32 = 1e-4;

fn gpu() -> Option<Math> {
    match Math::try_with_kind(BackendKind::Wgpu) {
        Ok(math) => Some(math),
        Err(Error::DeviceUnavailable(reason)) => {
            eprintln!("skipping GPU parity: {reason}");
            None
        }
        Err(e) => panic!("unexpected error creating the GPU context: {e}"),
    }
}

fn pattern(shape: &[usize], phase: f32) -> NDArray {
    let len = shape.iter().product();
    NDArray::new(shape.to_vec(), (0..len).map(|i| (i as f32 * 0.61 + phase).sin()).collect()).unwrap()
}

fn assert_parity(name: &str, f: impl Fn(&Math) -> Result<NDArray>) {
    let Some(gpu) = gpu() else { return };
    let cpu = Math::cpu();
    let expected = f(&cpu).unwrap();
    let actual = f(&gpu).unwrap();
    assert_eq!(expected.shape(), actual.shape(), "{name}: shapes differ");
    let (expected, actual) = (expected.data_sync().unwrap(), actual.data_sync().unwrap());
    for (i, (e, a)) in expected.iter().zip(&actual).enumerate() {
        assert!((e - a).abs() <= TOL * (1.0 + e.abs()), "{name}[{i}]: cpu {e} vs gpu {a}");
    }
}

#[test]
fn test_unary_parity() {
    let x = pattern(&[5, 7], 0.3);
    assert_parity("unary chain", |m| {
        let y = m.tanh(&m.sigmoid(&x)?)?;
        let z = m.add(&m.exp(&m.neg(&m.square(&x)?)?)?, &m.abs(&y)?)?;
        m.clip(&m.relu(&z)?, 0.1, 0.9)
    });
}

#[test]
fn test_binary_broadcast_parity() {
    let a = pattern(&[4, 6], 0.0);
    let row = pattern(&[6], 1.0);
    assert_parity("broadcast", |m| {
        let s = m.subtract(&a, &row)?;
        let p = m.multiply(&s, &m.scalar(2.5))?;
        m.maximum(&p, &m.minimum(&a, &row)?)
    });
}

#[test]
fn test_matmul_parity() {
    let a = pattern(&[17, 33], 0.2);
    let b = pattern(&[9, 33], 0.7);
    assert_parity("matmul", |m| {
        m.matmul_oriented(&a, &b, MatrixOrientation::Regular, MatrixOrientation::Transposed)
    });
}

#[test]
fn test_reduction_parity() {
    let x = pattern(&[6, 11], 0.4);
    assert_parity("sum", |m| m.sum(&x, Some(1)));
    assert_parity("max", |m| m.max(&x, Some(0)));
    assert_parity("softmax", |m| m.softmax(&x));
}

#[test]
fn test_pool_parity() {
    let x = pattern(&[2, 5, 5, 3], 0.9);
    assert_parity("max_pool", |m| m.max_pool(&x, [3, 3], [2, 2], Padding::Same));
    assert_parity("avg_pool", |m| m.avg_pool(&x, [2, 2], [1, 1], Padding::Valid));
}

#[test]
fn test_lstm_parity() {
    let cells = [
        LstmCell {
            kernel: pattern(&[3 + 4, 16], 0.1),
            bias: pattern(&[16], 0.5),
            forget_bias: NDArray::scalar(1.0),
        },
        LstmCell {
            kernel: pattern(&[4 + 2, 8], 0.8),
            bias: pattern(&[8], 0.2),
            forget_bias: NDArray::scalar(1.0),
        },
    ];
    let data = pattern(&[1, 3], 0.0);
    assert_parity("multi_rnn_cell", |m| {
        let state = LstmState::zeros(m, &[4, 2]);
        let once = m.multi_rnn_cell(&cells, &data, &state)?;
        let twice = m.multi_rnn_cell(&cells, &data, &once)?;
        m.concat(&twice.c[1], &twice.h[1], 1)
    });
}

#[test]
fn test_gpu_gradients_match() {
    let w = pattern(&[4, 3], 0.3);
    let x = pattern(&[2, 4], 0.6);
    assert_parity("matmul gradient", |m| {
        let grads = m.gradients(
            |m| {
                let probs = m.softmax(&m.matmul(&x, &w)?)?;
                m.sum(&m.square(&probs)?, None)
            },
            &[&w],
        )?;
        Ok(grads[0].clone())
    });
}
