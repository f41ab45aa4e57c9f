use core_affinity::{CoreId, get_core_ids, set_for_current};

/// Pins the calling thread to `core_id`.
pub fn try_pin_core(core_id: usize) -> anyhow::Result<usize> {
    if let Some(core_ids) = get_core_ids()
        && core_ids.iter().any(|c| c.id == core_id)
        && set_for_current(CoreId { id: core_id })
    {
        return Ok(core_id);
    }
    Err(anyhow::anyhow!("failed to pin core {core_id}"))
}

/// Round-robin placement: worker `index` goes to the `index % cores`-th core the OS reports.
pub fn pin_worker(index: usize) -> anyhow::Result<usize> {
    let core_ids = get_core_ids()
        .filter(|ids| !ids.is_empty())
        .ok_or_else(|| anyhow::anyhow!("no CPU cores reported by OS"))?;
    let core = core_ids[index % core_ids.len()];
    try_pin_core(core.id)
}
