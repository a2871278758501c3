use fieldsync_core::{AppendOutcome, OperationType, Priority};

use crate::commands::common::{
    open_engine, parse_operation_data, read_piped_stdin, resolve_entity_id,
};
use crate::config::Settings;
use crate::error::CliError;

pub async fn run_add(
    settings: &Settings,
    op_type: OperationType,
    entity: &str,
    entity_id: Option<String>,
    data: Option<String>,
    priority: Priority,
) -> Result<(), CliError> {
    let entity_id = resolve_entity_id(op_type, entity_id)?;
    let raw = match data {
        Some(data) => Some(data),
        None if op_type == OperationType::Delete => None,
        None => read_piped_stdin()?,
    };
    let data = parse_operation_data(op_type, raw.as_deref())?;

    let engine = open_engine(settings).await?;
    match engine
        .add_operation(op_type, entity, &entity_id, data, priority)
        .await?
    {
        AppendOutcome::Appended(operation) => {
            println!("{}  {entity}/{entity_id}", operation.id);
        }
        AppendOutcome::Collapsed { removed } => {
            println!(
                "Cancelled {} unsynced operations on {entity}/{entity_id}",
                removed.len()
            );
        }
    }
    Ok(())
}
