fn main() -> eyre::Result<()> {
    motion_cam::cli_app::cli_main()
}
