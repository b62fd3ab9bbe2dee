use anyhow::{anyhow, Result};
use log::info;
use triggered::{Listener, Trigger};

#[derive(Clone)]
pub struct Shutter {
    pub trigger: Trigger,
    pub signal: Listener,
}

impl Shutter {
    /// There should only be one of these per process
    pub fn new() -> Result<Self> {
        let (trigger, signal) = triggered::trigger();
        let ctrlc_trigger = trigger.clone();
        ctrlc::set_handler(move || {
            info!("got termination signal");
            ctrlc_trigger.trigger();
        })
        .map_err(|e| anyhow!("error setting Ctrl-C handler - do you have more than one? {}", e))?;

        Ok(Self { trigger, signal })
    }
}
