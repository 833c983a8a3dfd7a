use anyhow::Result;
use log::{Level, LevelFilter, Log, Metadata, Record};
use mlagents_core::{
    behavior::ObservationSpec,
    messages::{observation_to_array, AgentInfoMessage, ObservationMessage},
};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts warnings, the only logger of this test binary.
struct WarningCounter {
    warnings: AtomicUsize,
}

impl Log for WarningCounter {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Warn
    }

    fn log(&self, record: &Record) {
        if record.level() == Level::Warn {
            self.warnings.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn flush(&self) {}
}

static LOGGER: WarningCounter = WarningCounter {
    warnings: AtomicUsize::new(0),
};

fn agent(id: i32, values: Vec<f32>) -> AgentInfoMessage {
    AgentInfoMessage {
        id,
        observations: vec![ObservationMessage::float(vec![3], values)],
        ..Default::default()
    }
}

#[test]
fn test_nan_observation_is_replaced_with_one_warning() -> Result<()> {
    log::set_logger(&LOGGER).map_err(|e| anyhow::anyhow!("{}", e))?;
    log::set_max_level(LevelFilter::Warn);

    let infos = vec![
        agent(0, vec![1.0, 2.0, 3.0]),
        agent(1, vec![4.0, f32::NAN, 6.0]),
        agent(2, vec![7.0, 8.0, 9.0]),
    ];
    let refs: Vec<&AgentInfoMessage> = infos.iter().collect();
    let rows = observation_to_array(&refs, 0, &ObservationSpec::new(vec![3], "vector"))?;

    assert!(rows.iter().flatten().all(|v| v.is_finite()));
    assert_eq!(rows[0], vec![1.0, 2.0, 3.0]);
    assert_eq!(rows[1], vec![4.0, 0.0, 6.0]);
    assert_eq!(rows[2], vec![7.0, 8.0, 9.0]);
    assert_eq!(LOGGER.warnings.load(Ordering::SeqCst), 1);
    Ok(())
}
