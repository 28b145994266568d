//! Result codes and per-operation error types
use core::fmt;

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use xmrtc_kernel::error::ResultCode;
            /// assert_eq!(ResultCode::QueueOverflow.as_str(), "QueueOverflow");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that an operation of this crate
    /// can produce.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful. No additional information is available.
        Success = 0,
        /// The specified handle refers to a slot that has been released (and
        /// possibly reused by another object).
        NoAccess = -18,
        /// The current context disallows the operation. This usually means
        /// CPU Lock (the atomic section guarding the RTC state) is already
        /// active.
        BadContext = -25,
        /// An object couldn't be registered because its pool is full.
        QueueOverflow = -43,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                match x {
                    $( $name::$vname => Self::$vname, )*
                }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                    assert_eq!(ResultCode::$vname as i8, $name::$vname as i8);
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }
    };
}

define_error! {
    mod init_error {}
    /// Error type for [`Rtc::init`] and [`Rtc::uninit`].
    ///
    /// [`Rtc::init`]: crate::Rtc::init
    /// [`Rtc::uninit`]: crate::Rtc::uninit
    pub enum InitError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod get_time_error {}
    /// Error type for [`Rtc::time`] and [`Rtc::dst`].
    ///
    /// [`Rtc::time`]: crate::Rtc::time
    /// [`Rtc::dst`]: crate::Rtc::dst
    pub enum GetTimeError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod set_time_error {}
    /// Error type for [`Rtc::set_time`] and [`Rtc::set_dst`].
    ///
    /// [`Rtc::set_time`]: crate::Rtc::set_time
    /// [`Rtc::set_dst`]: crate::Rtc::set_dst
    pub enum SetTimeError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod add_alarm_error {}
    /// Error type for [`Rtc::add_alarm`].
    ///
    /// [`Rtc::add_alarm`]: crate::Rtc::add_alarm
    pub enum AddAlarmError {
        /// CPU Lock is active.
        BadContext,
        /// Every slot of the alarm pool is in use.
        QueueOverflow,
    }
}

define_error! {
    mod remove_alarm_error {}
    /// Error type for [`Rtc::remove_alarm`].
    ///
    /// Removing an alarm that is not registered is not an error.
    ///
    /// [`Rtc::remove_alarm`]: crate::Rtc::remove_alarm
    pub enum RemoveAlarmError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod create_timer_error {}
    /// Error type for [`Rtc::create_timer`].
    ///
    /// [`Rtc::create_timer`]: crate::Rtc::create_timer
    pub enum CreateTimerError {
        /// CPU Lock is active.
        BadContext,
        /// Every slot of the timer pool is in use.
        QueueOverflow,
    }
}

define_error! {
    mod delete_timer_error {}
    /// Error type for [`Rtc::delete_timer`].
    ///
    /// [`Rtc::delete_timer`]: crate::Rtc::delete_timer
    pub enum DeleteTimerError {
        /// The handle is stale.
        NoAccess,
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod start_timer_error {}
    /// Error type for [`Rtc::start_timer`].
    ///
    /// [`Rtc::start_timer`]: crate::Rtc::start_timer
    pub enum StartTimerError {
        /// The handle is stale.
        NoAccess,
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod stop_timer_error {}
    /// Error type for [`Rtc::stop_timer`] and [`Rtc::timer_remaining`].
    ///
    /// [`Rtc::stop_timer`]: crate::Rtc::stop_timer
    /// [`Rtc::timer_remaining`]: crate::Rtc::timer_remaining
    pub enum StopTimerError {
        /// The handle is stale.
        NoAccess,
        /// CPU Lock is active.
        BadContext,
    }
}

macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant = ResultCode::$Variant as _ ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        define_suberror! {
            @into
            #[into(ResultCode)]
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    (
        @into
        #[into( $Supererror0:path )]
        $( #[into( $Supererror:path )] )*
        enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        impl From<$Name> for $Supererror0 {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    ( @into enum $($_:tt)* ) => {};
}

define_suberror! {
    /// `BadContext`
    #[into(InitError)]
    #[into(GetTimeError)]
    #[into(SetTimeError)]
    #[into(AddAlarmError)]
    #[into(RemoveAlarmError)]
    #[into(CreateTimerError)]
    #[into(DeleteTimerError)]
    #[into(StartTimerError)]
    #[into(StopTimerError)]
    pub(crate) enum BadContextError {
        BadContext,
    }
}

define_suberror! {
    /// `NoAccess`
    #[into(DeleteTimerError)]
    #[into(StartTimerError)]
    #[into(StopTimerError)]
    pub(crate) enum NoAccessError {
        NoAccess,
    }
}

define_suberror! {
    /// `QueueOverflow`
    #[into(AddAlarmError)]
    #[into(CreateTimerError)]
    pub(crate) enum QueueOverflowError {
        QueueOverflow,
    }
}
