use quill_doc::FieldValue;
use quill_sim::{SimConfig, Simulation, CHECKED_FIELDS};
use std::time::Duration;

fn config(seed: u64, adversarial: bool) -> SimConfig {
    SimConfig {
        steps: 12,
        actors: 2,
        tick: Duration::from_millis(2),
        delay_min: Duration::from_millis(0),
        delay_max: Duration::from_millis(6),
        adversarial,
        seed: Some(seed),
    }
}

#[tokio::test]
async fn honest_actors_converge() {
    let report = Simulation::new(config(11, false))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert!(report.converged);
    assert_eq!(report.honest, vec!["owner", "editor-1", "editor-2"]);
    assert_eq!(report.refused_escalations, 0);
    assert!(report.accepted > 0);
    for name in CHECKED_FIELDS {
        assert!(report.values.contains_key(name), "missing {name}");
    }
}

#[tokio::test]
async fn adversary_is_rejected_and_honest_actors_converge() {
    let report = Simulation::new(config(5, true))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert!(report.converged);
    assert!(!report.honest.contains(&"mallory".to_string()));
    assert_eq!(report.refused_escalations, 1);
    assert!(report.rejected > 0);
}

#[tokio::test]
async fn title_is_a_string_register() {
    let report = Simulation::new(config(3, false))
        .unwrap()
        .run()
        .await
        .unwrap();

    match &report.values["title"] {
        FieldValue::Register(Some(value)) => assert!(value.is_string()),
        other => panic!("unexpected title {other:?}"),
    }
}

#[test]
fn invalid_config_is_refused() {
    let config = SimConfig {
        actors: 0,
        ..SimConfig::default()
    };
    assert!(Simulation::new(config).is_err());
}
