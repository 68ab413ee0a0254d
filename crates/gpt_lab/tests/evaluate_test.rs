mod common;

use gpt_lab::checkpoint::CHECKPOINT_FILE;
use gpt_lab::data::SplitPolicy;
use gpt_lab::evaluate::evaluate_only;
use gpt_lab::train::{train, ProgressEvent, RunContext};
use gpt_lab::{InitMode, LabError};

use common::{char_dataset, tiny_config};

#[test]
fn test_eval_only_reports_one_loss_per_seed_without_writing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let data = dir.path().join("data");
    let out = dir.path().join("out");
    char_dataset(&data, 20, SplitPolicy::Fraction(0.9))?;

    let mut config = tiny_config();
    config.max_iters = 2;
    train(&RunContext::new(config.clone(), &data, &out), &mut |_: &ProgressEvent| {})?;
    let before = std::fs::read(out.join(CHECKPOINT_FILE))?;

    config.init_from = InitMode::Resume;
    let ctx = RunContext::new(config, &data, &out);
    let report = evaluate_only(&ctx, 5)?;

    assert_eq!(report.step, 2);
    assert_eq!(report.losses.len(), 5);
    assert!(report.losses.iter().all(|l| l.is_finite() && *l > 0.0));
    assert!(report.std >= 0.0);
    assert_eq!(std::fs::read(out.join(CHECKPOINT_FILE))?, before);

    let again = evaluate_only(&ctx, 5)?;
    assert_eq!(again.losses, report.losses);
    Ok(())
}

#[test]
fn test_eval_only_from_scratch_needs_no_checkpoint() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let data = dir.path().join("data");
    let out = dir.path().join("out");
    char_dataset(&data, 20, SplitPolicy::Fraction(0.9))?;

    let ctx = RunContext::new(tiny_config(), &data, &out);
    let report = evaluate_only(&ctx, 2)?;
    assert_eq!(report.step, 0);
    assert_eq!(report.losses.len(), 2);
    assert!(!out.join(CHECKPOINT_FILE).exists());
    Ok(())
}

#[test]
fn test_eval_only_without_validation_split_is_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let data = dir.path().join("data");
    char_dataset(&data, 20, SplitPolicy::SkipValidation)?;

    let ctx = RunContext::new(tiny_config(), &data, dir.path().join("out"));
    assert!(matches!(
        evaluate_only(&ctx, 3),
        Err(LabError::InvalidConfig(_))
    ));
    Ok(())
}
