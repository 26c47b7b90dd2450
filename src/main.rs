fn main() -> anyhow::Result<()> {
    htc_flow::run()
}
