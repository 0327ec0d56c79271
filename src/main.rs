fn main() -> anyhow::Result<()> {
    pluginctl::run()?;
    Ok(())
}
