fn main() -> anyhow::Result<()> {
    bankql_lib::run()
}
