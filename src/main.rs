use anyhow::Result;
use ctrmon::MonitorBuilder;
use std::process::exit;

fn main() -> Result<()> {
    let code = MonitorBuilder::default().build()?.run()?;
    exit(code)
}
