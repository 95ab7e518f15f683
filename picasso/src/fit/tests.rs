//! Tests for PSF fitting.

use super::*;
use crate::testing::{Spot, noisy_spot_frame, seeded_rng, spot_frame};

fn candidate_at(frame: usize, x: usize, y: usize) -> Candidate {
    Candidate {
        frame,
        x,
        y,
        window_radius: 4,
        strength: 42.0,
    }
}

#[test]
fn test_recovers_isolated_spot() {
    let frame = spot_frame(2, 48, 48, 10.0, &[Spot::round(20.3, 24.6, 2000.0, 1.3)]);
    let fitter = Fitter::new(&Config::default());

    let loc = fitter.fit(&frame, &candidate_at(2, 20, 25)).unwrap();

    assert_eq!(loc.frame, 2);
    assert!((loc.x - 20.3).abs() < 0.01, "x = {}", loc.x);
    assert!((loc.y - 24.6).abs() < 0.01, "y = {}", loc.y);
    assert!((loc.photons - 2000.0).abs() / 2000.0 < 0.01, "photons = {}", loc.photons);
    assert!((loc.background - 10.0).abs() < 0.1);
    assert!((loc.sx - 1.3).abs() < 0.01);
    assert_eq!(loc.sx, loc.sy);
    assert!(loc.lpx > 0.0 && loc.lpy > 0.0);
    assert_eq!(loc.net_signal, 42.0);
    assert!(loc.iterations >= 1);
}

#[test]
fn test_brighter_spot_has_smaller_uncertainty() {
    let fitter = Fitter::new(&Config::default());
    let dim = spot_frame(0, 32, 32, 10.0, &[Spot::round(16.2, 15.9, 500.0, 1.3)]);
    let bright = spot_frame(0, 32, 32, 10.0, &[Spot::round(16.2, 15.9, 5000.0, 1.3)]);

    let dim = fitter.fit(&dim, &candidate_at(0, 16, 16)).unwrap();
    let bright = fitter.fit(&bright, &candidate_at(0, 16, 16)).unwrap();

    assert!(bright.lpx < dim.lpx);
    assert!(bright.lpy < dim.lpy);
    assert!(bright.lpx < 0.05);
}

#[test]
fn test_poisson_noise_within_tolerance() {
    let fitter = Fitter::new(&Config::default());
    let truth = Spot::round(16.4, 15.7, 3000.0, 1.3);
    let mut rng = seeded_rng(42);
    let mut total_error = 0.0;
    let trials = 20;

    for _ in 0..trials {
        let frame = noisy_spot_frame(0, 32, 32, 10.0, &[truth], &mut rng);
        let loc = fitter.fit(&frame, &candidate_at(0, 16, 16)).unwrap();

        let ex = (loc.x as f64 - truth.x).abs();
        let ey = (loc.y as f64 - truth.y).abs();
        assert!(ex < 0.2 && ey < 0.2, "error ({ex}, {ey})");
        assert!((loc.photons as f64 - truth.photons).abs() / truth.photons < 0.1);
        assert!(loc.lpx > 0.01 && loc.lpx < 0.1, "lpx = {}", loc.lpx);
        // Deviance per degree of freedom of a correct model is close to 1.
        assert!(loc.goodness_of_fit > 0.3 && loc.goodness_of_fit < 3.0);
        total_error += ex + ey;
    }

    assert!(total_error / (2.0 * trials as f64) < 0.05);
}

#[test]
fn test_least_squares_objective() {
    let config = Config {
        fit_objective: FitObjective::LeastSquares,
        ..Default::default()
    };
    let frame = spot_frame(0, 32, 32, 10.0, &[Spot::round(15.7, 16.35, 1500.0, 1.4)]);

    let loc = Fitter::new(&config).fit(&frame, &candidate_at(0, 16, 16)).unwrap();

    assert!((loc.x - 15.7).abs() < 0.01);
    assert!((loc.y - 16.35).abs() < 0.01);
    assert!((loc.sx - 1.4).abs() < 0.01);
    assert!(loc.lpx >= 0.0 && loc.lpy >= 0.0);
}

#[test]
fn test_elliptical_model_recovers_widths() {
    let config = Config {
        psf_model_variant: PsfVariant::EllipticalGaussian,
        ..Default::default()
    };
    let spot = Spot {
        x: 16.25,
        y: 15.8,
        photons: 3000.0,
        sigma_x: 1.1,
        sigma_y: 1.7,
    };
    let frame = spot_frame(0, 32, 32, 10.0, &[spot]);

    let loc = Fitter::new(&config).fit(&frame, &candidate_at(0, 16, 16)).unwrap();

    assert!((loc.x - 16.25).abs() < 0.01);
    assert!((loc.y - 15.8).abs() < 0.01);
    assert!((loc.sx - 1.1).abs() < 0.02, "sx = {}", loc.sx);
    assert!((loc.sy - 1.7).abs() < 0.02, "sy = {}", loc.sy);
    assert!(loc.ellipticity() > 0.3);
}

#[test]
fn test_camera_conversion_applied() {
    // Frame in ADU: baseline 100, 2 ADU per photon.
    let config = Config {
        camera: CameraConfig {
            baseline: 100.0,
            sensitivity: 0.5,
            gain: 1.0,
            quantum_efficiency: 1.0,
        },
        ..Default::default()
    };
    let photons = spot_frame(0, 32, 32, 10.0, &[Spot::round(16.0, 16.0, 2000.0, 1.3)]);
    let adu: Vec<f32> = photons.pixels().iter().map(|p| 100.0 + 2.0 * p).collect();
    let frame = Frame::new(0, 32, 32, adu);

    let loc = Fitter::new(&config).fit(&frame, &candidate_at(0, 16, 16)).unwrap();

    assert!((loc.photons - 2000.0).abs() / 2000.0 < 0.01);
    assert!((loc.background - 10.0).abs() < 0.1);
}

#[test]
fn test_blank_window_has_no_signal() {
    let frame = Frame::filled(0, 32, 32, 10.0);
    let result = Fitter::new(&Config::default()).fit(&frame, &candidate_at(0, 16, 16));
    assert_eq!(result.unwrap_err(), FitRejection::NoSignal);
}

#[test]
fn test_iteration_limit_rejects() {
    let config = Config {
        max_fit_iterations: 1,
        ..Default::default()
    };
    let frame = spot_frame(0, 32, 32, 10.0, &[Spot::round(16.4, 15.6, 2000.0, 1.3)]);
    let result = Fitter::new(&config).fit(&frame, &candidate_at(0, 16, 16));
    assert_eq!(result.unwrap_err(), FitRejection::NotConverged);
}

#[test]
fn test_window_outside_frame_rejected() {
    let frame = Frame::filled(0, 32, 32, 10.0);
    let result = Fitter::new(&Config::default()).fit(&frame, &candidate_at(0, 2, 16));
    assert_eq!(result.unwrap_err(), FitRejection::OutsideWindow);
}

#[test]
fn test_fit_all_keeps_order_and_counts_rejections() {
    let frame = spot_frame(
        5,
        64,
        32,
        10.0,
        &[
            Spot::round(12.2, 16.1, 2000.0, 1.3),
            Spot::round(48.6, 15.7, 2500.0, 1.3),
        ],
    );
    let candidates = [
        candidate_at(5, 49, 16),
        candidate_at(5, 30, 16), // empty window
        candidate_at(5, 12, 16),
    ];

    let fit = Fitter::new(&Config::default()).fit_all(&frame, &candidates);

    assert_eq!(fit.localizations.len(), 2);
    assert!((fit.localizations[0].x - 48.6).abs() < 0.01);
    assert!((fit.localizations[1].x - 12.2).abs() < 0.01);
    assert_eq!(fit.rejections.total(), 1);
    assert_eq!(fit.rejections.get(FitRejection::NoSignal), 1);
    assert_eq!(
        fit.rejections.iter().collect::<Vec<_>>(),
        vec![(FitRejection::NoSignal, 1)]
    );
}

#[test]
fn test_rejection_counts_merge() {
    let mut a = RejectionCounts::default();
    a.record(FitRejection::NotConverged);
    a.record(FitRejection::WidthCollapsed);
    let mut b = RejectionCounts::default();
    b.record(FitRejection::NotConverged);

    a.merge(&b);

    assert_eq!(a.get(FitRejection::NotConverged), 2);
    assert_eq!(a.get(FitRejection::WidthCollapsed), 1);
    assert_eq!(a.total(), 3);
    assert_eq!(FitRejection::WidthCollapsed.to_string(), "width_collapsed");
}

#[test]
fn test_hot_pixel_collapses_width() {
    let mut pixels = vec![10.0f32; 32 * 32];
    pixels[16 * 32 + 16] += 3000.0;
    let frame = Frame::new(0, 32, 32, pixels);

    let result = Fitter::new(&Config::default()).fit(&frame, &candidate_at(0, 16, 16));

    assert_eq!(result.unwrap_err(), FitRejection::WidthCollapsed);
}

#[test]
fn test_haze_wider_than_window_explodes_width() {
    let frame = spot_frame(0, 48, 48, 10.0, &[Spot::round(24.0, 24.0, 50_000.0, 6.0)]);

    let result = Fitter::new(&Config::default()).fit(&frame, &candidate_at(0, 24, 24));

    assert_eq!(result.unwrap_err(), FitRejection::WidthExploded);
}

#[test]
fn test_spot_beyond_window_edge_rejected() {
    // Centred 4.6 px right of the candidate with a radius-4 window.
    let frame = spot_frame(0, 48, 48, 10.0, &[Spot::round(24.6, 24.0, 2000.0, 1.3)]);

    let result = Fitter::new(&Config::default()).fit(&frame, &candidate_at(0, 20, 24));

    assert_eq!(result.unwrap_err(), FitRejection::OutsideWindow);
}

#[test]
fn test_zero_photon_curvature_is_singular() {
    let frame = spot_frame(0, 32, 32, 10.0, &[]);
    let fitter = Fitter::new(&Config::default());
    let window = fitter.extract_window(&frame, &candidate_at(0, 16, 16)).unwrap();
    let model = SymmetricGaussian::new(PsfBounds {
        window_radius: 4.0,
        min_sigma: 0.4,
    });

    // Without photons the position and width columns of the Jacobian vanish.
    let result = fitter.uncertainty(&model, &window, &[0.0, 0.0, 0.0, 10.0, 1.3], 1.0);

    assert_eq!(result.unwrap_err(), FitRejection::SingularCurvature);
}
