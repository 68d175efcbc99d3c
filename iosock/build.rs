fn main() {
  cfg_aliases::cfg_aliases! {
      linux: { target_os = "linux" },
      apple: { target_vendor = "apple" },
      epoll: { any(target_os = "linux", target_os = "android") },
      kqueue: {
        any(
          target_os = "macos",
          target_os = "ios",
          target_os = "tvos",
          target_os = "watchos",
          target_os = "freebsd",
          target_os = "dragonfly"
        )
      }
  }
}
