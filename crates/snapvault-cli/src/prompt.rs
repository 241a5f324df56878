use std::io::{self, BufRead, IsTerminal, Write};

use zeroize::Zeroizing;

use snapvault_types::{Result, SnapvaultError};

/// Whether a passphrase can be asked for at all.
pub(crate) fn can_prompt() -> bool {
    io::stdin().is_terminal()
}

/// Ask for a passphrase on stderr with terminal echo off.
pub(crate) fn read_passphrase(prompt: &str) -> Result<Zeroizing<String>> {
    eprint!("{prompt}");
    io::stderr().flush()?;

    let stdin = io::stdin();
    let read = without_echo(&stdin, || read_passphrase_line(&mut stdin.lock()));
    eprintln!();
    read
}

/// One line from `reader` with its line ending removed. The buffer is
/// zeroized on drop, including any spare capacity left by the read.
fn read_passphrase_line(reader: &mut impl BufRead) -> Result<Zeroizing<String>> {
    let mut line = Zeroizing::new(String::new());
    if reader.read_line(&mut line)? == 0 {
        return Err(SnapvaultError::InvalidInput(
            "no passphrase entered (end of input)".into(),
        ));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

#[cfg(unix)]
fn without_echo<T>(stdin: &io::Stdin, read: impl FnOnce() -> Result<T>) -> Result<T> {
    use std::os::fd::AsRawFd;

    struct RestoreTermios {
        fd: i32,
        original: libc::termios,
    }

    impl Drop for RestoreTermios {
        fn drop(&mut self) {
            let _ = unsafe {
                // Safe because values were obtained from a successful tcgetattr call.
                libc::tcsetattr(self.fd, libc::TCSANOW, &self.original)
            };
        }
    }

    if !stdin.is_terminal() {
        return read();
    }

    let fd = stdin.as_raw_fd();
    let mut original = unsafe {
        // Safe because zeroed memory is immediately initialized by tcgetattr.
        std::mem::zeroed::<libc::termios>()
    };
    if unsafe {
        // Safe because fd is a valid stdin file descriptor and `original` is writable.
        libc::tcgetattr(fd, &mut original)
    } != 0
    {
        return Err(io::Error::last_os_error().into());
    }

    let mut silent = original;
    silent.c_lflag &= !libc::ECHO;
    if unsafe {
        // Safe because fd is valid and `silent` is a valid termios struct.
        libc::tcsetattr(fd, libc::TCSANOW, &silent)
    } != 0
    {
        return Err(io::Error::last_os_error().into());
    }

    let _restore = RestoreTermios { fd, original };
    read()
}

#[cfg(not(unix))]
fn without_echo<T>(_stdin: &io::Stdin, read: impl FnOnce() -> Result<T>) -> Result<T> {
    read()
}
