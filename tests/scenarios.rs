use ddalab_dsp::{
    ChannelInfo, ChannelKind, DspError, EpochConfig, EpochExtractor, EpochStatus, EventMarker,
    EventStream, FilterDesigner, FilterSpec, Recording, RejectionCriteria, RejectionReason,
    ResampleConfig, Resampler, RunControl, StreamingFilterEngine,
};
use std::f64::consts::PI;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn sine(freq: f64, fs: f64, n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| (2.0 * PI * freq * i as f64 / fs).sin())
        .collect()
}

/// 10 Hz sine at 1000 Hz through a zero-phase 5 Hz lowpass
#[test]
fn test_lowpass_removes_sine_above_cutoff() {
    init();
    let rec = Recording::from_labels(&["Cz"], vec![sine(10.0, 1000.0, 5000)], 1000.0)
        .expect("valid recording");
    let filter = FilterDesigner::for_recording(&rec)
        .design(&FilterSpec::lowpass(5.0))
        .expect("lowpass design");
    let out = StreamingFilterEngine::default()
        .apply(&rec, &filter, &RunControl::default())
        .expect("filtering");

    assert!(out.completion.is_complete());
    assert_eq!(out.recording.n_samples(), 5000);
    let peak = out.recording.channel_data(0)[1000..4000]
        .iter()
        .fold(0.0f64, |m, v| m.max(v.abs()));
    assert!(peak < 0.05, "residual amplitude {}", peak);
    assert_eq!(out.recording.provenance().parent, Some(rec.provenance().id));
}

/// Event at sample 1000, window [-0.2, 0.5) s at 1000 Hz
#[test]
fn test_epoch_spans_expected_samples() {
    init();
    let ramp: Vec<f64> = (0..3000).map(|i| i as f64).collect();
    let rec = Recording::from_labels(&["Cz"], vec![ramp], 1000.0).expect("valid recording");
    let events = EventStream::new(1000.0, vec![EventMarker::new(1000, 1i64)]).expect("events");
    let config = EpochConfig {
        baseline: None,
        ..EpochConfig::new(-0.2, 0.5)
    };

    let set = EpochExtractor::new(config)
        .extract_recording(&rec, &events, &RunControl::default())
        .expect("extraction");

    assert_eq!(set.len(), 1);
    assert_eq!(set.n_times(), 700);
    let epoch = &set.epochs()[0];
    assert_eq!(epoch.start_sample, 800);
    assert_eq!(epoch.data[0].first().copied(), Some(800.0));
    assert_eq!(epoch.data[0].last().copied(), Some(1499.0));
    assert_eq!(set.provenance().parent, Some(rec.provenance().id));
}

/// 150 uV peak-to-peak against a 100 uV ceiling
#[test]
fn test_peak_to_peak_rejection_names_channel() {
    init();
    let n = 2000;
    let mut fz = vec![0.0; n];
    fz[1100..1150].iter_mut().for_each(|v| *v = 150e-6);
    let cz: Vec<f64> = (0..n).map(|i| if i % 2 == 0 { 5e-6 } else { -5e-6 }).collect();
    let rec = Recording::new(
        vec![ChannelInfo::eeg("Fz"), ChannelInfo::eeg("Cz")],
        vec![fz, cz],
        1000.0,
    )
    .expect("valid recording");
    let events = EventStream::new(1000.0, vec![EventMarker::new(1000, 1i64)]).expect("events");
    let config = EpochConfig {
        reject: Some(RejectionCriteria::default().kind(ChannelKind::Eeg, 100e-6)),
        ..EpochConfig::new(-0.2, 0.5)
    };

    let set = EpochExtractor::new(config)
        .extract(&rec, &events, &RunControl::default())
        .expect("rejection is not an error");

    let epoch = &set.epochs()[0];
    assert_eq!(epoch.channel_flags, vec![true, false]);
    match &epoch.status {
        EpochStatus::Rejected { reasons } => {
            assert_eq!(reasons.len(), 1);
            match &reasons[0] {
                RejectionReason::PeakToPeak {
                    channel,
                    peak_to_peak,
                    threshold,
                } => {
                    assert_eq!(channel, "Fz");
                    assert!((peak_to_peak - 150e-6).abs() < 1e-12);
                    assert_eq!(*threshold, 100e-6);
                }
                other => panic!("unexpected reason {:?}", other),
            }
        }
        EpochStatus::Retained => panic!("epoch should be rejected"),
    }
    assert_eq!(set.n_retained(), 0);
    assert!(set.skipped().is_empty());
}

/// 500-sample recording, 800-sample kernel
#[test]
fn test_kernel_longer_than_recording() {
    init();
    let rec = Recording::from_labels(&["Cz"], vec![sine(10.0, 1000.0, 500)], 1000.0)
        .expect("valid recording");
    let filter = FilterDesigner::for_recording(&rec)
        .design(&FilterSpec::lowpass(40.0).with_length(800))
        .expect("explicit lengths are not capped at design time");

    let err = StreamingFilterEngine::default()
        .apply(&rec, &filter, &RunControl::default())
        .unwrap_err();
    match err {
        DspError::InsufficientSamples {
            required,
            available,
        } => {
            assert!(required >= 800);
            assert_eq!(available, 500);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

/// 1000 Hz -> 250 Hz on 4000 samples
#[test]
fn test_downsample_output_length() {
    init();
    let rec = Recording::from_labels(
        &["Cz", "Pz"],
        vec![sine(10.0, 1000.0, 4000), sine(3.0, 1000.0, 4000)],
        1000.0,
    )
    .expect("valid recording");
    let out = Resampler::new(1000.0, &ResampleConfig::new(250.0))
        .expect("resampler")
        .apply(&rec, &RunControl::default())
        .expect("resampling");

    assert_eq!(out.recording.n_samples(), 1000);
    assert_eq!(out.recording.sample_rate(), 250.0);
    assert_eq!(out.recording.channel_labels(), vec!["Cz", "Pz"]);
}
