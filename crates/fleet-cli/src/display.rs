use colored::*;

pub fn success<T: AsRef<str>>(message: T) {
    println!("{} {}", "✓".green(), message.as_ref());
}

pub fn warning<T: AsRef<str>>(message: T) {
    eprintln!("{} {}", "!".yellow(), message.as_ref().yellow());
}

pub fn header<T: AsRef<str>>(title: T) {
    println!("{}", title.as_ref().cyan().bold());
}
