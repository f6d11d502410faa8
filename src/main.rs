fn main() -> anyhow::Result<()> {
    ragchat_lib::run()
}
