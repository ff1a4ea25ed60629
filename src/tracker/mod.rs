pub mod channels;

use crate::db::Database;
use crate::state::NodeState;

/// Update all trackers with the snapshot of the current pass.
pub fn update(db: &Database, state: &NodeState) -> anyhow::Result<()> {
    channels::update(db, &state.channels, state.collected_at)?;
    Ok(())
}
