fn main() {
    sayonara_lib::run()
}
