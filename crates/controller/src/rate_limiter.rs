// Rate limiter using lock-free token bucket algorithm
//
// Uses a single AtomicU64 to store both token count and timestamp for
// maximum performance under high concurrency.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Error returned when rate limit is exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitExceeded;

impl std::fmt::Display for RateLimitExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Rate limit exceeded")
    }
}

impl std::error::Error for RateLimitExceeded {}

/// Lock-free rate limiter using token bucket algorithm with hard limit (no burst)
/// Supports both QPS and QPM limits simultaneously using a unified atomic operation
#[derive(Debug)]
pub struct RateLimiter {
    max_per_secs: u32, // 0 = unlimited, max 32,767 (15 bits)
    max_per_min: u32,  // 0 = unlimited, max 262,143 (18 bits)
    // Single atomic storing packed state (64 bits):
    // [minute_window_id: 15][minute_tokens: 18][second_window_id: 16][second_tokens: 15]
    state: AtomicU64,
    startup_time: Instant,
}

impl RateLimiter {
    /// Create a rate limiter with both QPS and QPM limits
    /// max_per_secs: 0 = unlimited, >0 = tokens per second limit
    /// max_per_min: 0 = unlimited, >0 = tokens per minute limit
    /// Returns error if limits exceed bit field capacity
    pub fn new(max_per_secs: u32, max_per_min: u32) -> Result<Self, &'static str> {
        // Validate limits fit in their bit fields
        if max_per_secs > 32_767 {
            // 15 bits
            return Err("max_per_secs exceeds 32,767 limit");
        }
        if max_per_min > 262_143 {
            // 18 bits
            return Err("max_per_min exceeds 262,143 limit");
        }

        let startup_time = Instant::now();

        // Initialize state with full tokens available for immediate use
        // This prevents the "first minute" bug where QPM limiters don't work initially
        let initial_sec_tokens = if max_per_secs == 0 {
            0x7FFF // Max value for 15 bits (32,767)
        } else {
            max_per_secs
        };
        let initial_min_tokens = if max_per_min == 0 {
            0x3FFFF // Max value for 18 bits (262,143)
        } else {
            max_per_min
        };

        // Initialize window IDs to 0 to match time calculation at startup
        // (elapsed time starts at 0)
        let initial_sec_id = 0u32;
        let initial_min_id = 0u32;

        let initial_state = pack_state(
            initial_min_id,
            initial_min_tokens,
            initial_sec_id,
            initial_sec_tokens,
        );

        Ok(Self {
            max_per_secs,
            max_per_min,
            state: AtomicU64::new(initial_state),
            startup_time,
        })
    }

    /// Try to acquire a token, returning error if rate limit is exceeded
    pub fn try_acquire_token(&self) -> Result<(), RateLimitExceeded> {
        let start_time_secs = self.get_current_time_seconds();
        const TIMEOUT_SECS: u32 = 2; // Prevent indefinite blocking in async context

        let mut current_time_secs = start_time_secs;

        loop {
            let current_second_id = current_time_secs & 0xFFFF; // 16 bits
            let current_minute_id = (current_time_secs / 60) & 0x7FFF; // 15 bits

            let current_state = self.state.load(Ordering::Acquire);
            let (last_min_id, last_min_tokens, last_sec_id, last_sec_tokens) =
                unpack_state(current_state);

            // Calculate intended token counts based on current time (prevents stale refill race)
            let sec_window_fresh = self.has_window_expired(current_second_id, last_sec_id, true);
            let min_window_fresh = self.has_window_expired(current_minute_id, last_min_id, false);

            // Fail fast: if no windows are fresh and we need tokens but have none
            if !sec_window_fresh && !min_window_fresh {
                if self.max_per_secs > 0 && last_sec_tokens == 0 {
                    return Err(RateLimitExceeded);
                }
                if self.max_per_min > 0 && last_min_tokens == 0 {
                    return Err(RateLimitExceeded);
                }
            }

            let mut available_sec_tokens = if self.max_per_secs == 0 {
                // Unlimited: keep existing count to track usage, but ensure we have tokens
                if sec_window_fresh {
                    0x7FFF // Max value for 15 bits (32,767)
                } else {
                    last_sec_tokens.max(1) // Ensure at least 1 token remains to allow request
                }
            } else if sec_window_fresh {
                self.max_per_secs // Window expired: full refill
            } else {
                last_sec_tokens // Same window: use current count
            };

            let mut available_min_tokens = if self.max_per_min == 0 {
                // Unlimited: keep existing count to track usage, but ensure we have tokens
                if min_window_fresh {
                    0x3FFFF // Max value for 18 bits (262,143)
                } else {
                    last_min_tokens.max(1) // Ensure at least 1 token remains to allow request
                }
            } else if min_window_fresh {
                self.max_per_min // Window expired: full refill
            } else {
                last_min_tokens // Same window: use current count
            };

            // Check availability and consume tokens atomically (prevents premature failure)
            if self.max_per_secs > 0 {
                if available_sec_tokens == 0 {
                    // No tokens available - fail fast
                    return Err(RateLimitExceeded);
                }
            }
            // Always consume second tokens for tracking (even when unlimited)
            if available_sec_tokens > 0 {
                available_sec_tokens -= 1;
            }

            if self.max_per_min > 0 {
                if available_min_tokens == 0 {
                    // No tokens available - fail fast
                    return Err(RateLimitExceeded);
                }
            }
            // Always consume minute tokens for tracking (even when unlimited)
            if available_min_tokens > 0 {
                available_min_tokens -= 1;
            }

            // Attempt atomic update with calculated tokens
            let new_state = pack_state(
                current_minute_id,
                available_min_tokens,
                current_second_id,
                available_sec_tokens,
            );

            if self
                .state
                .compare_exchange_weak(
                    current_state,
                    new_state,
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                // Success: both limits satisfied atomically
                return Ok(());
            }
            // CAS failed, retry with fresh state
            current_time_secs = self.get_current_time_seconds();
            // Timeout protection for tokio context
            if current_time_secs > start_time_secs + TIMEOUT_SECS {
                return Err(RateLimitExceeded);
            }
        }
    }

    /// Check available tokens for monitoring (returns min of both limits)
    pub fn tokens_available(&self) -> u32 {
        let current_time_secs = self.get_current_time_seconds();
        let current_second_id = current_time_secs & 0xFFFF;
        let current_minute_id = (current_time_secs / 60) & 0x7FFF;

        let current_state = self.state.load(Ordering::Acquire);
        let (last_min_id, last_min_tokens, last_sec_id, last_sec_tokens) =
            unpack_state(current_state);

        let sec_window_expired = self.has_window_expired(current_second_id, last_sec_id, true);
        let min_window_expired = self.has_window_expired(current_minute_id, last_min_id, false);

        // Calculate current token availability (non-consuming)
        let available_sec_tokens = if self.max_per_secs == 0 {
            u32::MAX // Unlimited
        } else if sec_window_expired {
            self.max_per_secs
        } else {
            last_sec_tokens
        };

        let available_min_tokens = if self.max_per_min == 0 {
            u32::MAX // Unlimited
        } else if min_window_expired {
            self.max_per_min
        } else {
            last_min_tokens
        };

        // Return the limiting factor
        available_sec_tokens.min(available_min_tokens)
    }

    /// Get configured max per second
    pub fn max_per_secs(&self) -> u32 {
        self.max_per_secs
    }

    /// Get configured max per minute
    pub fn max_per_min(&self) -> u32 {
        self.max_per_min
    }

    /// Calculate current QPS and QPM based on token consumption
    /// Returns (QPS, QPM) for both rate-limited and unlimited servers
    /// Returns (0, 0) if windows are stale (more than 1 second/minute since last activity)
    /// 
    /// This method should be called periodically by monitoring systems for self-healing.
    /// It automatically clears stale state to prevent wrap-around bugs where old activity
    /// could be incorrectly reported after 18+ hours (QPS) or 22+ days (QPM).
    pub fn get_current_qps_qpm(&self) -> (u32, u32) {
        let current_time_secs = self.get_current_time_seconds();
        let current_second_id = current_time_secs & 0xFFFF;
        let current_minute_id = (current_time_secs / 60) & 0x7FFF;
        
        let observed_state = self.state.load(Ordering::Acquire);
        let (last_min_id, last_min_tokens, last_sec_id, last_sec_tokens) = unpack_state(observed_state);
        
        // Calculate window differences accounting for wrap-around
        let sec_window_diff = if current_second_id >= last_sec_id {
            current_second_id - last_sec_id
        } else {
            // Handle wrap-around (65536 second cycle)
            (0x10000 - last_sec_id) + current_second_id
        };
        
        let min_window_diff = if current_minute_id >= last_min_id {
            current_minute_id - last_min_id
        } else {
            // Handle wrap-around (32768 minute cycle)
            (0x8000 - last_min_id) + current_minute_id
        };
        
        // Calculate initial token values
        let initial_sec_tokens = if self.max_per_secs == 0 { 0x7FFF } else { self.max_per_secs };
        let initial_min_tokens = if self.max_per_min == 0 { 0x3FFFF } else { self.max_per_min };
        
        // Check if we need to clear stale state
        let sec_stale_with_consumption = sec_window_diff > 1 && last_sec_tokens < initial_sec_tokens;
        let min_stale_with_consumption = min_window_diff > 1 && last_min_tokens < initial_min_tokens;
        
        if sec_stale_with_consumption || min_stale_with_consumption {
            // Attempt to clear stale state atomically
            let new_state = pack_state(current_minute_id, initial_min_tokens, 
                                      current_second_id, initial_sec_tokens);
            
            // Only update if state hasn't changed (prevents race with concurrent acquire_token)
            let _ = self.state.compare_exchange(
                observed_state,
                new_state,
                Ordering::Release,
                Ordering::Acquire
            );
            // Whether the update succeeded or not, return 0 for stale windows
            return (0, 0);
        }
        
        // Calculate QPS (tokens consumed in second window)
        let qps = if sec_window_diff > 1 {
            0  // Stale window
        } else {
            initial_sec_tokens.saturating_sub(last_sec_tokens)
        };
        
        // Calculate QPM (tokens consumed in minute window)
        let qpm = if min_window_diff > 1 {
            0  // Stale window
        } else {
            initial_min_tokens.saturating_sub(last_min_tokens)
        };
        
        (qps, qpm)
    }


    /// Determines if a new time window has started, correctly handling both normal time progression and timer wrap-around
    fn has_window_expired(&self, current_id: u32, last_id: u32, is_second_window: bool) -> bool {
        if current_id == last_id {
            return false; // Same window
        }

        let half_range = if is_second_window {
            32767 // Half of 65535 (16-bit max)
        } else {
            16383 // Half of 32767 (15-bit max)
        };

        let diff = current_id.wrapping_sub(last_id);

        // Handle normal progression and wrap-around
        // diff > 0 && diff <= half_range means forward progression
        // Large diff values indicate backward movement (stale data)
        diff > 0 && diff <= half_range
    }

    /// Get current time in seconds since startup
    pub fn get_current_time_seconds(&self) -> u32 {
        // This could be speed optimized with CLOCK_MONOTONIC_COARSE, but
        // starting at zero brings some clarity while debugging.
        let elapsed = self.startup_time.elapsed();
        elapsed.as_secs() as u32
    }
}

static_assertions::const_assert_eq!(15 + 18 + 16 + 15, 64);

/// Pack 15-bit minute ID, 18-bit minute tokens, 16-bit second ID, 15-bit second tokens
fn pack_state(min_id: u32, min_tokens: u32, sec_id: u32, sec_tokens: u32) -> u64 {
    ((min_id as u64 & 0x7FFF) << 49) |      // 15 bits: minute window ID
    ((min_tokens as u64 & 0x3FFFF) << 31) | // 18 bits: minute tokens
    ((sec_id as u64 & 0xFFFF) << 15) |      // 16 bits: second window ID
    (sec_tokens as u64 & 0x7FFF) // 15 bits: second tokens
}

/// Unpack 64-bit state into four values with correct bit masks
/// Returns (min_id, min_tokens, sec_id, sec_tokens)
fn unpack_state(state: u64) -> (u32, u32, u32, u32) {
    let min_id = ((state >> 49) & 0x7FFF) as u32; // 15 bits
    let min_tokens = ((state >> 31) & 0x3FFFF) as u32; // 18 bits
    let sec_id = ((state >> 15) & 0xFFFF) as u32; // 16 bits
    let sec_tokens = (state & 0x7FFF) as u32; // 15 bits
    (min_id, min_tokens, sec_id, sec_tokens)
}
