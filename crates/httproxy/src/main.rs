fn main() -> anyhow::Result<()> {
    smol::block_on(httproxy::run())
}
