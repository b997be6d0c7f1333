mod common;

use common::{pattern_image, screen_with_pattern, Harness, HarnessOptions, MockBrowser, PixelClassifier};
use image::RgbaImage;
use macropilot::{Rect, Resolution, ResolveOptions, Screenshot, StrategyKind, StrategyOutcome};
use std::collections::HashMap;
use std::sync::Arc;

#[tokio::test]
async fn template_match_finds_the_planted_target() {
    let pattern = pattern_image(16, 16);
    let screen = screen_with_pattern(128, 96, 40, 20, &pattern);
    let h = Harness::new(&[("sign_in", &pattern)], screen);

    let report = h
        .ctx
        .resolver
        .resolve("sign_in", &ResolveOptions::default())
        .await
        .unwrap();

    match report.resolution {
        Resolution::Found {
            point,
            confidence,
            strategy,
            ..
        } => {
            assert_eq!(strategy, StrategyKind::TemplateMatch);
            assert!(confidence > 0.95, "confidence was {confidence}");
            assert!((point.x - 48.0).abs() < 1.5, "x was {}", point.x);
            assert!((point.y - 28.0).abs() < 1.5, "y was {}", point.y);
        }
        other => panic!("expected a match, got {other:?}"),
    }

    // The chain started with DOM, which was unavailable outside a
    // browser context.
    assert_eq!(report.transitions[0].0, StrategyKind::DomSelector);
    assert!(matches!(
        report.transitions[0].1,
        StrategyOutcome::Unavailable { .. }
    ));
    assert!(matches!(
        report.transitions[1].1,
        StrategyOutcome::Matched { .. }
    ));
}

#[tokio::test]
async fn hidpi_coordinates_are_divided_by_the_scale_factor() {
    let pattern = pattern_image(16, 16);
    let screen = screen_with_pattern(128, 96, 40, 20, &pattern);
    let h = Harness::with_options(
        &[("sign_in", &pattern)],
        screen,
        HarnessOptions {
            scale: Some(2.0),
            ..Default::default()
        },
    );

    let report = h
        .ctx
        .resolver
        .resolve("sign_in", &ResolveOptions::default())
        .await
        .unwrap();
    match report.resolution {
        Resolution::Found { point, .. } => {
            assert!((point.x - 24.0).abs() < 1.0, "x was {}", point.x);
            assert!((point.y - 14.0).abs() < 1.0, "y was {}", point.y);
        }
        other => panic!("expected a match, got {other:?}"),
    }
}

/// Three classifier windows score 0.95, 0.90 and 0.80; `match_index: 1`
/// must pick the 0.90 one.
#[tokio::test]
async fn match_index_selects_the_nth_best_candidate() {
    let mut img = RgbaImage::from_pixel(192, 64, image::Rgba([10, 10, 10, 255]));
    img.put_pixel(0, 0, image::Rgba([200, 10, 10, 255]));
    img.put_pixel(64, 0, image::Rgba([201, 10, 10, 255]));
    img.put_pixel(128, 0, image::Rgba([202, 10, 10, 255]));
    let screen = Screenshot {
        width: 192,
        height: 64,
        image_data: img.into_raw(),
    };

    let classifier = PixelClassifier {
        confidences: HashMap::from([(200, 0.95), (201, 0.90), (202, 0.80)]),
    };
    let h = Harness::with_options(
        &[],
        screen,
        HarnessOptions {
            classifier: Some(Arc::new(classifier)),
            ..Default::default()
        },
    );

    let opts = ResolveOptions {
        match_index: 1,
        ..Default::default()
    };
    let report = h.ctx.resolver.resolve("thing", &opts).await.unwrap();

    match report.resolution {
        Resolution::Found {
            point,
            confidence,
            strategy,
            ..
        } => {
            assert_eq!(strategy, StrategyKind::NeuralClassifier);
            assert!((confidence - 0.90).abs() < 1e-9);
            // The 0.90 window sits at x=64 with a 64x64 extent.
            assert!((point.x - 96.0).abs() < 0.5, "x was {}", point.x);
            assert!((point.y - 32.0).abs() < 0.5, "y was {}", point.y);
        }
        other => panic!("expected a match, got {other:?}"),
    }

    // DOM and template were both unavailable before the classifier
    // produced candidates.
    assert_eq!(report.transitions.len(), 3);
    assert!(matches!(
        report.transitions[0],
        (StrategyKind::DomSelector, StrategyOutcome::Unavailable { .. })
    ));
    assert!(matches!(
        report.transitions[1],
        (StrategyKind::TemplateMatch, StrategyOutcome::Unavailable { .. })
    ));
    assert!(matches!(
        report.transitions[2],
        (StrategyKind::NeuralClassifier, StrategyOutcome::Matched { candidates: 3 })
    ));
}

#[tokio::test]
async fn match_index_beyond_the_candidates_is_not_found() {
    let pattern = pattern_image(16, 16);
    let screen = screen_with_pattern(128, 96, 40, 20, &pattern);
    let h = Harness::new(&[("sign_in", &pattern)], screen);

    let opts = ResolveOptions {
        match_index: 10,
        ..Default::default()
    };
    let report = h.ctx.resolver.resolve("sign_in", &opts).await.unwrap();
    assert!(matches!(report.resolution, Resolution::NotFound { .. }));
}

#[tokio::test]
async fn dom_strategy_wins_inside_a_browser_context() {
    let browser = MockBrowser {
        connected: true,
        elements: HashMap::from([(
            "#login".to_string(),
            (
                Rect {
                    x: 10.0,
                    y: 10.0,
                    width: 20.0,
                    height: 10.0,
                },
                String::new(),
            ),
        )]),
        ..Default::default()
    };
    let h = Harness::with_options(
        &[],
        common::blank_screen(64, 64),
        HarnessOptions {
            browser: Some(Arc::new(browser)),
            selectors_json: Some(r##"{"login_button": "#login"}"##.to_string()),
            ..Default::default()
        },
    );
    h.ctx.set_browser_active(true);

    let report = h
        .ctx
        .resolver
        .resolve("login_button", &ResolveOptions::default())
        .await
        .unwrap();
    match report.resolution {
        Resolution::Found {
            point, strategy, ..
        } => {
            assert_eq!(strategy, StrategyKind::DomSelector);
            // DOM rects are logical already; no scale division applies.
            assert_eq!((point.x, point.y), (20.0, 15.0));
        }
        other => panic!("expected a DOM match, got {other:?}"),
    }
}

#[tokio::test]
async fn every_attempt_lands_in_the_learning_store() {
    let pattern = pattern_image(16, 16);
    let screen = screen_with_pattern(128, 96, 40, 20, &pattern);
    let h = Harness::new(&[("sign_in", &pattern)], screen);

    h.ctx
        .resolver
        .resolve("sign_in", &ResolveOptions::default())
        .await
        .unwrap();
    h.ctx
        .resolver
        .resolve("ghost", &ResolveOptions::default())
        .await
        .unwrap();

    let hit = h.ctx.learning.stats("sign_in").unwrap();
    assert_eq!(hit.total_attempts, 1);
    assert_eq!(hit.successful_attempts, 1);
    assert!((hit.accuracy - 1.0).abs() < 1e-9);

    let miss = h.ctx.learning.stats("ghost").unwrap();
    assert_eq!(miss.total_attempts, 1);
    assert_eq!(miss.failed_attempts, 1);
    assert!((miss.accuracy).abs() < 1e-9);

    // Successful attempts carry a crop of the matched region.
    let attempts = h.ctx.learning.attempts_for("sign_in");
    assert!(attempts[0].region_image.as_ref().unwrap().exists());
}
