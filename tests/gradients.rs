//! Tape gradients checked against central finite differences.

use ndtape::conv_util::Padding;
use ndtape::math::LstmCell;
use ndtape::{Math, NDArray, Result, array};

const EPS: f32 = 1e-2;
const TOL: f32 = 2e-2;

fn numeric_gradient(math: &Math, f: &dyn Fn(&Math, &NDArray) -> Result<NDArray>, x: &NDArray) -> Vec<f32> {
    let base = x.data_sync().unwrap();
    (0..base.len())
        .map(|i| {
            let eval = |delta: f32| {
                let mut data = base.clone();
                data[i] += delta;
                let shifted = NDArray::new(x.shape().to_vec(), data).unwrap();
                math.scope(|_| f(math, &shifted)?.get_scalar()).unwrap()
            };
            (eval(EPS) - eval(-EPS)) / (2.0 * EPS)
        })
        .collect()
}

fn check_gradient(f: impl Fn(&Math, &NDArray) -> Result<NDArray>, x: &NDArray) {
    let math = Math::cpu();
    let analytic = math.gradients(|m| f(m, x), &[x]).unwrap()[0].data_sync().unwrap();
    let numeric = numeric_gradient(&math, &f, x);
    assert_eq!(analytic.len(), numeric.len());
    for (i, (a, n)) in analytic.iter().zip(&numeric).enumerate() {
        assert!(
            (a - n).abs() <= TOL * (1.0 + n.abs()),
            "element {i}: tape gave {a}, finite differences gave {n}"
        );
    }
}

#[test]
fn test_add_mul_gradient() {
    let c = array!([[0.5, -1.5], [2.0, 0.25]]);
    let x = array!([[1.0, 2.0], [-0.5, 0.75]]);
    check_gradient(|m, x| m.sum(&m.multiply(x, &m.add(x, &c)?)?, None), &x);
}

#[test]
fn test_broadcast_gradient() {
    let row = array!([0.3, -0.7, 1.1]);
    let x = array!([[1.0, 2.0, 3.0], [-1.0, 0.5, 0.0]]);
    // the row gradient sums over the broadcast axis
    check_gradient(|m, r| m.sum(&m.square(&m.subtract(&x, r)?)?, None), &row);
}

#[test]
fn test_matmul_gradient() {
    let w = array!([[0.2, -0.4], [0.6, 0.1], [-0.3, 0.5]]);
    let x = array!([[1.0, -2.0, 0.5], [0.25, 1.5, -1.0]]);
    check_gradient(|m, x| m.sum(&m.square(&m.matmul(x, &w)?)?, None), &x);
    check_gradient(|m, w| m.sum(&m.square(&m.matmul(&x, w)?)?, None), &w);
}

#[test]
fn test_sigmoid_tanh_gradient() {
    let x = array!([-2.0, -0.3, 0.0, 0.8, 1.7]);
    check_gradient(|m, x| m.sum(&m.multiply(&m.sigmoid(x)?, &m.tanh(x)?)?, None), &x);
}

#[test]
fn test_exp_log_divide_gradient() {
    let x = array!([0.5, 1.0, 2.5]);
    let d = array!([2.0, 3.0, 4.0]);
    check_gradient(|m, x| m.sum(&m.divide(&m.log(&m.exp(&m.square(x)?)?)?, &d)?, None), &x);
}

#[test]
fn test_softmax_gradient() {
    let weights = array!([1.0, -2.0, 3.0]);
    let x = array!([[0.1, 0.4, -0.2], [1.0, -1.0, 0.5]]);
    check_gradient(|m, x| m.sum(&m.multiply(&m.softmax(x)?, &weights)?, None), &x);
}

#[test]
fn test_log_softmax_gradient() {
    let target = array!([[0.0, 1.0, 0.0]]);
    let x = array!([[0.3, -0.6, 1.2]]);
    check_gradient(|m, x| m.neg(&m.sum(&m.multiply(&m.log_softmax(x)?, &target)?, None)?), &x);
}

#[test]
fn test_max_pool_gradient() {
    // distinct values, so the argmax does not move under perturbation
    let x = NDArray::new(vec![1, 4, 4, 1], (0..16).map(|i| ((i * 7) % 16) as f32 * 0.1).collect()).unwrap();
    check_gradient(
        |m, x| m.sum(&m.square(&m.max_pool(x, [2, 2], [2, 2], Padding::Valid)?)?, None),
        &x,
    );
}

#[test]
fn test_avg_pool_gradient() {
    let x = NDArray::new(vec![1, 3, 3, 2], (0..18).map(|i| (i as f32 - 9.0) * 0.05).collect()).unwrap();
    check_gradient(
        |m, x| m.sum(&m.square(&m.avg_pool(x, [2, 2], [1, 1], Padding::Same)?)?, None),
        &x,
    );
}

#[test]
fn test_lstm_kernel_gradient() {
    let units = 2;
    let kernel = NDArray::new(vec![4, 8], (0..32).map(|i| ((i % 9) as f32 - 4.0) * 0.1).collect()).unwrap();
    let bias = NDArray::zeros(vec![8]);
    let data = array!([[0.5, -1.0]]);
    let c = NDArray::fill(vec![1, units], 0.1);
    let h = NDArray::fill(vec![1, units], -0.2);
    let forget_bias = NDArray::scalar(1.0);
    check_gradient(
        |m, k| {
            let cell = LstmCell {
                kernel: k.clone(),
                bias: bias.clone(),
                forget_bias: forget_bias.clone(),
            };
            let (c, h) = cell.step(m, &data, &c, &h)?;
            m.add(&m.sum(&c, None)?, &m.sum(&h, None)?)
        },
        &kernel,
    );
}

#[test]
fn test_gradient_through_views() {
    let x = array!([[1.0, 2.0], [3.0, -0.5]]);
    check_gradient(|m, x| m.sum(&m.square(&x.as_1d()?)?, None), &x);

    let row = array!([0.5, -1.0, 2.0, 0.25]);
    let w = array!([[1.0, 0.5], [-2.0, 0.0]]);
    check_gradient(|m, r| m.sum(&m.exp(&m.matmul(&r.as_2d(2, 2)?, &w)?)?, None), &row);
}

#[test]
fn test_view_gradient_keeps_target_shape() {
    let math = Math::cpu();
    let x = array!([[1.0, 2.0], [3.0, 4.0]]);
    let grads = math
        .gradients(
            |m| {
                let flat = m.square(&x.as_1d()?)?;
                let cube = m.multiply(&x.as_3d([1, 2, 2])?, &m.scalar(3.0))?;
                m.add(&m.sum(&flat, None)?, &m.sum(&cube, None)?)
            },
            &[&x],
        )
        .unwrap();
    assert_eq!(grads[0].shape(), &[2, 2]);
    assert_eq!(grads[0].data_sync().unwrap(), vec![5.0, 7.0, 9.0, 11.0]);
}

#[test]
fn test_reused_input_accumulates() {
    let math = Math::cpu();
    let x = array!([1.5, -2.0]);
    let unused = array!([3.0]);
    let grads = math
        .gradients(|m| m.sum(&m.add(&m.multiply(&x, &x)?, &x)?, None), &[&x, &unused])
        .unwrap();
    assert_eq!(grads[0].data_sync().unwrap(), vec![4.0, -3.0]);
    assert_eq!(grads[1].data_sync().unwrap(), vec![0.0]);
}

#[test]
fn test_gradients_release_intermediates() {
    let math = Math::cpu();
    let x = math.array(vec![3], vec![0.1, 0.2, 0.3]).unwrap();
    let (value, grads) = math
        .value_and_gradients(|m| m.sum(&m.tanh(&m.sigmoid(&x)?)?, None), &[&x])
        .unwrap();
    assert!(value.get_scalar().unwrap() > 0.0);
    // x, the value and one gradient
    assert_eq!(math.live_arrays(), 3);
    drop(grads);
    assert_eq!(math.live_arrays(), 2);
}
