mod common;

use anyhow::Result;
use code_relevance_backend_core::TowerMode;
use code_relevance_router::{pairs_from_args, read_pairs, resolve_model, run, RouterError, ScoreResponse};
use common::{checkpoint, HIDDEN_SIZE};

fn parse_lines(output: &[u8]) -> Result<Vec<ScoreResponse>> {
    let output = std::str::from_utf8(output)?;
    Ok(output
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<Vec<_>, _>>()?)
}

#[test]
fn test_run_scores_every_pair() -> Result<()> {
    let dir = checkpoint()?;
    let model_root = resolve_model(&dir.path().to_string_lossy(), None, None, None)?;
    assert_eq!(model_root, dir.path());

    let pairs = pairs_from_args(
        vec![
            "how to sort list".to_string(),
            "how to".to_string(),
            "how to sort list".to_string(),
        ],
        vec![
            "def sort ( x )".to_string(),
            "x".to_string(),
            "def sort ( x )".to_string(),
        ],
    )?;

    let mut output = Vec::new();
    run(&model_root, None, None, TowerMode::Shared, 16, &pairs, false, &mut output)?;

    let responses = parse_lines(&output)?;
    assert_eq!(responses.len(), 3);
    for response in responses.iter() {
        assert!((0.0..=1.0).contains(&response.score));
        assert!(response.features.is_none());
    }
    // Identical pairs in one batch score the same
    assert!(is_close::default()
        .abs_tol(1e-5)
        .is_close(responses[0].score, responses[2].score));
    Ok(())
}

#[test]
fn test_run_with_features() -> Result<()> {
    let dir = checkpoint()?;
    let input = r#"{"query": "how to sort list", "code": "def sort ( x )"}"#;
    let pairs = read_pairs(input.as_bytes())?;

    let mut output = Vec::new();
    run(dir.path(), None, None, TowerMode::Shared, 16, &pairs, true, &mut output)?;

    let responses = parse_lines(&output)?;
    assert_eq!(responses.len(), 1);
    let features = responses[0].features.as_ref().expect("features were requested");
    assert_eq!(features.len(), HIDDEN_SIZE);
    assert!(features.iter().all(|f| (-1.0..=1.0).contains(f)));
    Ok(())
}

#[test]
fn test_run_without_pairs() -> Result<()> {
    let dir = checkpoint()?;

    let mut output = Vec::new();
    let err = run(dir.path(), None, None, TowerMode::Shared, 16, &[], false, &mut output)
        .err()
        .expect("an empty input must be rejected");

    assert!(matches!(err, RouterError::Validation(_)));
    assert!(output.is_empty());
    Ok(())
}
