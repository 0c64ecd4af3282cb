use assert_cmd::Command;

pub fn tumbler_bin() -> Command {
    #[allow(deprecated)]
    {
        Command::cargo_bin("tumbler").expect("tumbler test binary should build")
    }
}
