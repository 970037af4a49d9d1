use serde_json::{json, Value};

use crate::persist::types::{Event, ExportFormat, PersistError, PersistResult};

pub const CSV_HEADER: [&str; 6] = ["ID", "Event Type", "Aggregate ID", "Sequence", "Timestamp", "Description"];

/// Convert an event into its export JSON object
pub fn event_to_json(event: &Event) -> PersistResult<Value> {
    Ok(json!({
        "id": event.id.to_string(),
        "event_type": event.event_type,
        "aggregate_id": event.aggregate_id,
        "sequence": event.sequence,
        "timestamp": event.timestamp.to_rfc3339(),
        "data": serde_json::to_value(&event.payload)?,
    }))
}

pub fn to_json(events: &[Event]) -> PersistResult<Vec<u8>> {
    let rows = events.iter().map(event_to_json).collect::<PersistResult<Vec<_>>>()?;
    Ok(serde_json::to_vec_pretty(&rows)?)
}

pub fn to_csv(events: &[Event]) -> PersistResult<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADER)?;
    for event in events {
        writer.write_record([
            event.id.to_string(),
            event.event_type.clone(),
            event.aggregate_id.clone(),
            event.sequence.to_string(),
            event.timestamp.to_rfc3339(),
            event.payload.description(),
        ])?;
    }
    writer.into_inner().map_err(|e| PersistError::Io(e.into_error()))
}

pub fn render(events: &[Event], format: ExportFormat) -> PersistResult<Vec<u8>> {
    match format {
        ExportFormat::Json => to_json(events),
        ExportFormat::Csv => to_csv(events),
    }
}
