use inodefs::{FileSystem, Settings};
use std::env;

pub fn main() -> inodefs::Result<()> {
    let image = env::args()
        .nth(1)
        .unwrap_or_else(|| "hello.img".to_string());

    let mut fs = FileSystem::format(&image, &Settings::new(1024, 32))?;
    fs.mkdir("/greetings")?;
    fs.write("/greetings/hello", b"Hello, world!\n")?;
    fs.lnsym("/greetings/hello", "/hi")?;

    for entry in fs.list("/greetings")? {
        println!("{}", entry);
    }
    print!("{}", String::from_utf8_lossy(&fs.read("/hi")?));
    print!("{}", fs.dumpe2fs()?);
    fs.close()?;
    Ok(())
}
