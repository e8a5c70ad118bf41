use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rvt_core::nn::{GroupedProjection, Module, Padding, SourceSpec};
use rvt_core::{RvtError, Tensor};
use std::collections::HashMap;

fn ramp(shape: &[usize]) -> Tensor {
    Tensor::new(
        ArrayD::from_shape_fn(IxDyn(shape), |i| {
            0.1 * i[1] as f32 - 0.05 * i[2] as f32 + 0.02 * i[3] as f32 + 0.3 * i[0] as f32
        }),
        false,
    )
}

fn finalized(mut proj: GroupedProjection, seed: u64) -> GroupedProjection {
    let mut rng = StdRng::seed_from_u64(seed);
    proj.finalize(&mut rng).unwrap();
    proj
}

#[test]
fn test_preserve_and_shrink_shapes() {
    let mut proj = GroupedProjection::new(6, 3).unwrap();
    proj.add(SourceSpec::new(6).groups(3).kernel_size(3)).unwrap();
    let proj = finalized(proj, 0);
    assert_eq!(proj.forward(&[ramp(&[2, 6, 5, 4])]).unwrap().shape(), vec![2, 6, 5, 4]);

    let mut proj = GroupedProjection::new(6, 3).unwrap();
    proj.add(
        SourceSpec::new(6)
            .groups(3)
            .kernel_size(3)
            .padding(Padding::Shrink),
    )
    .unwrap();
    let proj = finalized(proj, 0);
    assert_eq!(proj.forward(&[ramp(&[2, 6, 5, 4])]).unwrap().shape(), vec![2, 6, 3, 2]);
}

#[test]
fn test_oversized_shrink_kernel_gives_single_token() {
    let mut proj = GroupedProjection::new(2, 1).unwrap();
    proj.add(SourceSpec::new(3).kernel_size(5).padding(Padding::Shrink))
        .unwrap();
    let proj = finalized(proj, 1);
    let y = proj.forward(&[ramp(&[1, 3, 3, 2])]).unwrap();
    assert_eq!(y.shape(), vec![1, 2, 1, 1]);

    // Larger in one direction only: the other still shrinks normally.
    let y = proj.forward(&[ramp(&[1, 3, 7, 2])]).unwrap();
    assert_eq!(y.shape(), vec![1, 2, 3, 1]);
}

#[test]
fn test_group_isolation() {
    let mut proj = GroupedProjection::new(4, 2).unwrap();
    proj.add(SourceSpec::new(4).groups(2).kernel_size(3)).unwrap();
    let proj = finalized(proj, 2);

    let base = ramp(&[1, 4, 4, 4]);
    let y0 = proj.forward(&[base.clone()]).unwrap().data();

    for group in 0..2 {
        let mut perturbed = base.data();
        for c in group * 2..group * 2 + 2 {
            for v in perturbed.index_axis_mut(ndarray::Axis(1), c).iter_mut() {
                *v += 1.0;
            }
        }
        let y1 = proj.forward(&[Tensor::new(perturbed, false)]).unwrap().data();
        for c in 0..4 {
            let changed = y0
                .index_axis(ndarray::Axis(1), c)
                .iter()
                .zip(y1.index_axis(ndarray::Axis(1), c).iter())
                .any(|(a, b)| (a - b).abs() > 1e-6);
            assert_eq!(changed, c / 2 == group, "group {} channel {}", group, c);
        }
    }
}

#[test]
fn test_intergroup_source_never_maps_group_onto_itself() {
    let mut proj = GroupedProjection::new(4, 2).unwrap();
    proj.add_intergroup().unwrap();
    let mut proj = finalized(proj, 3);

    // Even an all-ones kernel is masked on the diagonal blocks.
    let mut state = HashMap::new();
    state.insert(
        "sources.0.weight".to_string(),
        Tensor::new(ArrayD::ones(IxDyn(&[4, 4, 1, 1])), false),
    );
    assert_eq!(proj.load_state_dict(&state, "").unwrap(), 1);

    let x = Tensor::from_vec(&[1, 4, 1, 1], vec![1.0, 1.0, 0.0, 0.0], false).unwrap();
    let y = proj.forward(&[x]).unwrap().data();
    assert_eq!(y.iter().copied().collect::<Vec<_>>(), vec![0.0, 0.0, 2.0, 2.0]);

    // Freshly initialised kernels are zero on the diagonal blocks as well.
    let fresh = {
        let mut p = GroupedProjection::new(4, 2).unwrap();
        p.add_intergroup().unwrap();
        finalized(p, 4)
    };
    let w = fresh.parameters()[0].data();
    for o in 0..4 {
        for i in 0..4 {
            if o / 2 == i / 2 {
                assert_eq!(w[[o, i, 0, 0]], 0.0);
            }
        }
    }
}

#[test]
fn test_masked_kernel_gets_no_gradient_on_diagonal() {
    let mut proj = GroupedProjection::new(4, 2).unwrap();
    proj.add_intergroup().unwrap();
    let proj = finalized(proj, 5);
    proj.forward(&[ramp(&[1, 4, 2, 2])]).unwrap().sum().backward();
    let g = proj.parameters()[0].grad().unwrap();
    for o in 0..4 {
        for i in 0..4 {
            if o / 2 == i / 2 {
                assert_eq!(g[[o, i, 0, 0]], 0.0);
            } else {
                assert!(g[[o, i, 0, 0]] != 0.0);
            }
        }
    }
}

#[test]
fn test_sources_sum_then_gain_and_bias() {
    let mut proj = GroupedProjection::new(2, 1)
        .unwrap()
        .with_gain(true)
        .with_bias(true);
    proj.add(SourceSpec::new(1)).unwrap();
    proj.add(SourceSpec::new(1)).unwrap();
    let mut proj = finalized(proj, 6);

    let mut state = HashMap::new();
    let w0 = Tensor::from_vec(&[2, 1, 1, 1], vec![1.0, 2.0], false).unwrap();
    let w1 = Tensor::from_vec(&[2, 1, 1, 1], vec![3.0, -1.0], false).unwrap();
    state.insert("p.sources.0.weight".to_string(), w0);
    state.insert("p.sources.1.weight".to_string(), w1);
    state.insert("p.gain".to_string(), Tensor::from_vec(&[2], vec![2.0, 0.5], false).unwrap());
    state.insert("p.bias".to_string(), Tensor::from_vec(&[2], vec![0.1, -0.1], false).unwrap());
    assert_eq!(proj.load_state_dict(&state, "p").unwrap(), 4);

    let a = Tensor::from_vec(&[1, 1, 1, 1], vec![1.0], false).unwrap();
    let b = Tensor::from_vec(&[1, 1, 1, 1], vec![2.0], false).unwrap();
    let y = proj.forward(&[a, b]).unwrap().data();
    // ch0: (1*1 + 3*2) * 2 + 0.1, ch1: (2*1 - 1*2) * 0.5 - 0.1
    assert!((y[[0, 0, 0, 0]] - 14.1).abs() < 1e-6);
    assert!((y[[0, 1, 0, 0]] + 0.1).abs() < 1e-6);
}

#[test]
fn test_load_state_dict_rejects_wrong_shape() {
    let mut proj = GroupedProjection::new(2, 1).unwrap();
    proj.add(SourceSpec::new(3)).unwrap();
    let mut proj = finalized(proj, 7);
    let mut state = HashMap::new();
    state.insert("sources.0.weight".to_string(), Tensor::zeros(&[3, 2, 1, 1], false));
    assert!(matches!(
        proj.load_state_dict(&state, ""),
        Err(RvtError::ShapeMismatch { .. })
    ));
}

#[test]
fn test_forward_errors() {
    let mut proj = GroupedProjection::new(2, 1).unwrap();
    proj.add(SourceSpec::new(3)).unwrap();
    proj.add(SourceSpec::new(2)).unwrap();
    assert!(matches!(
        proj.forward(&[ramp(&[1, 3, 2, 2]), ramp(&[1, 2, 2, 2])]),
        Err(RvtError::Configuration(_))
    ));
    let proj = finalized(proj, 8);

    assert!(matches!(
        proj.forward(&[ramp(&[1, 3, 2, 2])]),
        Err(RvtError::Configuration(_))
    ));
    assert!(matches!(
        proj.forward(&[ramp(&[1, 2, 2, 2]), ramp(&[1, 2, 2, 2])]),
        Err(RvtError::Configuration(_))
    ));
    assert!(matches!(
        proj.forward(&[ramp(&[1, 3, 2, 2]), ramp(&[2, 2, 2, 2])]),
        Err(RvtError::ShapeMismatch { .. })
    ));
    assert!(matches!(
        proj.forward(&[ramp(&[1, 3, 2, 2]), ramp(&[1, 2, 3, 2])]),
        Err(RvtError::ShapeMismatch { .. })
    ));
    assert!(matches!(
        proj.forward(&[Tensor::zeros(&[3, 2], false), ramp(&[1, 2, 2, 2])]),
        Err(RvtError::InvalidArgument(_))
    ));
}

#[test]
fn test_parameters_receive_gradients() {
    let mut proj = GroupedProjection::new(4, 2)
        .unwrap()
        .with_gain(true)
        .with_bias(true);
    proj.add(SourceSpec::new(3).kernel_size(3)).unwrap();
    let proj = finalized(proj, 9);
    proj.forward(&[ramp(&[2, 3, 3, 3])])
        .unwrap()
        .mul(&ramp(&[2, 4, 3, 3]))
        .sum()
        .backward();
    for (name, p) in proj.named_parameters("") {
        let g = p.grad().unwrap_or_else(|| panic!("{} has no gradient", name));
        assert!(g.iter().any(|v| *v != 0.0), "{} gradient is zero", name);
    }
    proj.zero_grad();
    assert!(proj.parameters().iter().all(|p| p.grad().is_none()));
}
